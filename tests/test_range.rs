use sluice::error::ParseError;
use sluice::http::range::{
    ContentRange, Range, content_range, create_boundary, final_boundary, multipart_length, parse,
    part_header, resolve,
};

#[test]
fn test_parse_forms() {
    let ranges = parse("bytes=0-49,100-149,-20", 16).unwrap();
    assert_eq!(
        ranges,
        vec![Range::new(0, 50), Range::new(100, 150), Range::new(-20, -1)]
    );
    assert_eq!(parse("bytes=500-", 16).unwrap(), vec![Range::new(500, -1)]);
}

#[test]
fn test_parse_rejects_malformed() {
    for value in [
        "items=0-1",
        "bytes=",
        "bytes=-",
        "bytes=a-b",
        "bytes=9-3",
        "bytes=-0",
        "bytes=0-10,5-20",
    ] {
        assert_eq!(parse(value, 16), Err(ParseError::InvalidRange), "{value}");
    }
}

#[test]
fn test_resolve_against_length() {
    let ranges = parse("bytes=0-9,90-200", 16).unwrap();
    let resolved = resolve(&ranges, Some(100)).unwrap();
    assert_eq!(resolved, vec![Range::new(0, 10), Range::new(90, 100)]);

    let suffix = resolve(&[Range::new(-30, -1)], Some(10)).unwrap();
    assert_eq!(suffix, vec![Range::new(0, 10)]);

    let open = resolve(&[Range::new(4, -1)], Some(10)).unwrap();
    assert_eq!(open, vec![Range::new(4, 10)]);
}

#[test]
fn test_resolve_unsatisfiable() {
    assert_eq!(
        resolve(&[Range::new(100, 200)], Some(100)),
        Err(ParseError::InvalidRange)
    );
    assert_eq!(resolve(&[Range::new(-5, -1)], None), Err(ParseError::InvalidRange));
    assert_eq!(
        resolve(&[Range::new(0, 5)], None).unwrap(),
        vec![Range::new(0, 5)]
    );
}

#[test]
fn test_content_range_value() {
    assert_eq!(content_range(&Range::new(0, 10), Some(100)), "bytes 0-9/100");
    assert_eq!(content_range(&Range::new(5, 6), None), "bytes 5-5/*");
}

#[test]
fn test_multipart_length_matches_framing() {
    let ranges = [Range::new(0, 5), Range::new(10, 12)];
    let boundary = create_boundary(7, 1_700_000_000);
    assert_eq!(boundary.len(), 16);

    let mut body = String::new();
    for range in &ranges {
        body.push_str(&part_header(&boundary, range, Some(20), Some("text/plain")));
        body.push_str(&"x".repeat(range.len() as usize));
    }
    body.push_str(&final_boundary(&boundary));

    assert!(body.contains("Content-Range: bytes 10-11/20\r\n\r\n"));
    assert_eq!(
        multipart_length(&ranges, &boundary, Some(20), Some("text/plain")),
        body.len() as u64
    );
}

#[test]
fn test_boundaries_differ_per_seed() {
    assert_ne!(create_boundary(1, 42), create_boundary(2, 42));
}

#[test]
fn test_content_range_header() {
    let range = ContentRange::parse("bytes 0-499/1234").unwrap();
    assert_eq!((range.start, range.end, range.size), (0, 500, Some(1234)));

    let range = ContentRange::parse("bytes 10-19/*").unwrap();
    assert_eq!(range.size, None);

    for value in ["bytes 5-1/10", "bytes 0-20/10", "0-1/2", "bytes 0-1"] {
        assert_eq!(
            ContentRange::parse(value),
            Err(ParseError::InvalidContentRange),
            "{value}"
        );
    }
}

#[test]
fn test_last_byte_at_i64_max_is_rejected() {
    assert_eq!(
        parse("bytes=0-9223372036854775807", 16),
        Err(ParseError::InvalidRange)
    );
    assert_eq!(
        parse("bytes=0-9223372036854775806", 16).unwrap(),
        vec![Range::new(0, i64::MAX)]
    );
    assert_eq!(
        ContentRange::parse("bytes 0-9223372036854775807/*"),
        Err(ParseError::InvalidContentRange)
    );
}
