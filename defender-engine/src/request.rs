//! Parsed request view handed to the scanner by the host, plus the
//! query-string and body decoding the zone walk relies on.

/// One HTTP request as seen by the engine
///
/// The host server owns request acquisition; the engine only needs the
/// already-read pieces below.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    /// Path component, percent-encoded as received
    pub uri: String,
    pub query_string: Option<String>,
    /// Header pairs in arrival order, duplicates preserved
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub client_ip: String,
}

impl HttpRequest {
    /// First header with the given name, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Body scanning applies to POST and PUT only
    pub fn has_scannable_method(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST") || self.method.eq_ignore_ascii_case("PUT")
    }
}

/// Decode %XX escapes; `+` becomes a space
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = |b: u8| (b as char).to_digit(16);
                match (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi * 16 + lo) as u8);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split a query string (or urlencoded body) into decoded (name, value) pairs
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| match chunk.split_once('=') {
            Some((name, value)) => (percent_decode(name), percent_decode(value)),
            None => (percent_decode(chunk), String::new()),
        })
        .collect()
}

/// One decoded part of a multipart/form-data body
#[derive(Debug, Clone)]
pub struct MultipartPart {
    pub name: String,
    /// Present for file-upload parts
    pub filename: Option<String>,
    pub value: String,
}

/// Boundary parameter from a multipart Content-Type header
pub fn multipart_boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .next()
}

/// Decode a multipart/form-data body into its parts
///
/// Forgiving by design: parts without a Content-Disposition name are
/// dropped, and both CRLF and bare-LF section separators are accepted.
pub fn parse_multipart(body: &str, boundary: &str) -> Vec<MultipartPart> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();

    for section in body.split(delimiter.as_str()) {
        let section = section.trim_start_matches("\r\n").trim_start_matches('\n');
        if section.is_empty() || section.starts_with("--") {
            continue;
        }

        let (head, value) = match section
            .split_once("\r\n\r\n")
            .or_else(|| section.split_once("\n\n"))
        {
            Some(split) => split,
            None => continue,
        };

        let disposition = match head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with("content-disposition:"))
        {
            Some(line) => line,
            None => continue,
        };

        let name = match disposition_param(disposition, "name") {
            Some(name) => name,
            None => continue,
        };

        parts.push(MultipartPart {
            name,
            filename: disposition_param(disposition, "filename"),
            value: value.trim_end_matches('\n').trim_end_matches('\r').to_string(),
        });
    }

    parts
}

fn disposition_param(line: &str, key: &str) -> Option<String> {
    line.split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim_matches('"').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
        assert_eq!(percent_decode("%3Cscript%3E"), "<script>");
        // malformed escapes pass through
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn test_parse_query_pairs() {
        let pairs = parse_query("x=union&y=1&flag");
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("x".to_string(), "union".to_string()));
        assert_eq!(pairs[2], ("flag".to_string(), String::new()));
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req = HttpRequest {
            headers: vec![("Content-Type".to_string(), "text/plain".to_string())],
            ..Default::default()
        };
        assert_eq!(req.content_type(), Some("text/plain"));
    }

    #[test]
    fn test_multipart_boundary_extraction() {
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=----xyz"),
            Some("----xyz")
        );
        assert_eq!(
            multipart_boundary("multipart/form-data; boundary=\"quoted\""),
            Some("quoted")
        );
        assert_eq!(multipart_boundary("application/json"), None);
    }

    #[test]
    fn test_parse_multipart_fields_and_files() {
        let body = "--AaB03x\r\n\
                    Content-Disposition: form-data; name=\"comment\"\r\n\
                    \r\n\
                    hello world\r\n\
                    --AaB03x\r\n\
                    Content-Disposition: form-data; name=\"upload\"; filename=\"shell.php\"\r\n\
                    Content-Type: application/octet-stream\r\n\
                    \r\n\
                    <?php ?>\r\n\
                    --AaB03x--\r\n";

        let parts = parse_multipart(body, "AaB03x");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "comment");
        assert_eq!(parts[0].value, "hello world");
        assert!(parts[0].filename.is_none());
        assert_eq!(parts[1].filename.as_deref(), Some("shell.php"));
    }
}
