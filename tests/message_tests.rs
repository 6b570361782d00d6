use http_scan_jobs::message::{
    parse_headers, parse_http_request, parse_http_response, parse_status_line, ParseError,
};

#[test]
fn minimal_request_gets_default_protocol() {
    let req = parse_http_request("GET /").expect("parse ok");
    assert_eq!(req.method, "GET");
    assert_eq!(req.uri, "/");
    assert_eq!(req.protocol, "HTTP/1.1");
    assert!(req.headers.is_empty());
    assert_eq!(req.body, "");
}

#[test]
fn request_without_uri_is_a_start_line_error() {
    assert!(matches!(
        parse_http_request("GET"),
        Err(ParseError::MalformedStartLine(_))
    ));
}

#[test]
fn response_with_headers_and_body() {
    let resp =
        parse_http_response("HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\n\r\nBody text")
            .expect("parse ok");
    assert_eq!(resp.protocol_version, "HTTP/1.1");
    assert_eq!(resp.status_code, "404");
    assert_eq!(resp.status_message, "Not Found");
    assert_eq!(resp.headers.len(), 1);
    assert_eq!(resp.headers["content-type"], "text/plain");
    assert_eq!(resp.body, "Body text");
}

#[test]
fn header_value_keeps_later_colons() {
    let headers = parse_headers(["X-Custom: a:b:c"]);
    assert_eq!(headers["x-custom"], "a:b:c");

    let req = parse_http_request("GET / HTTP/1.1\nReferer: http://example.test:8080/x\n\n")
        .expect("parse ok");
    assert_eq!(req.headers["referer"], "http://example.test:8080/x");
}

#[test]
fn bare_lf_and_crlf_are_equivalent() {
    let crlf = parse_http_request("POST /a HTTP/1.1\r\nHost: h\r\n\r\nx=1\r\ny=2").unwrap();
    let lf = parse_http_request("POST /a HTTP/1.1\nHost: h\n\nx=1\ny=2").unwrap();
    assert_eq!(crlf, lf);
    assert_eq!(lf.body, "x=1\r\ny=2");
}

#[test]
fn status_line_reason_phrase_boundaries() {
    let empty_reason = parse_status_line("HTTP/1.1 200 ").expect("trailing space accepted");
    assert_eq!(empty_reason.status_message, "");
    assert!(matches!(
        parse_status_line("HTTP/1.1 200"),
        Err(ParseError::MalformedStatusLine(_))
    ));
    let long = parse_status_line("HTTP/1.0 503 Service Temporarily Unavailable").unwrap();
    assert_eq!(long.status_message, "Service Temporarily Unavailable");
}

#[test]
fn response_start_line_errors_propagate() {
    assert!(matches!(
        parse_http_response("not a status line\r\n\r\n"),
        Err(ParseError::MalformedStatusLine(_))
    ));
    assert_eq!(parse_http_response(""), Err(ParseError::EmptyInput));
}
