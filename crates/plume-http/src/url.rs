//! Request-target splitting

use plume_core::numeric::str2i;

/// Parts of `scheme://host[:port]/path`, borrowed from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Url<'a> {
    pub scheme: &'a [u8],
    pub host: &'a [u8],
    pub port: Option<&'a [u8]>,
    pub path: &'a [u8],
}

impl Url<'_> {
    /// Numeric port, if present and in range.
    pub fn port_number(&self) -> Option<u16> {
        self.port.and_then(|p| u16::try_from(str2i(p)).ok())
    }
}

/// Split a request target.
///
/// An origin-form target (starting with `/`) or one without a colon is
/// all path. Otherwise the colon must be followed by `//`.
pub fn parse_url(s: &[u8]) -> Option<Url<'_>> {
    let colon = match s.iter().position(|&b| b == b':') {
        Some(i) if s.first() != Some(&b'/') => i,
        _ => {
            return Some(Url {
                path: s,
                ..Url::default()
            })
        }
    };

    let scheme = &s[..colon];
    let rest = s[colon + 1..].strip_prefix(b"//")?;
    let end = rest.iter().position(|&b| b == b'/').unwrap_or(rest.len());
    let (authority, path) = rest.split_at(end);

    let (host, port) = match authority.iter().position(|&b| b == b':') {
        Some(i) => (&authority[..i], Some(&authority[i + 1..])),
        None => (authority, None),
    };

    Some(Url {
        scheme,
        host,
        port,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every part must be a sub-slice of the input.
    fn within(outer: &[u8], inner: &[u8]) -> bool {
        let o = outer.as_ptr() as usize;
        let i = inner.as_ptr() as usize;
        inner.is_empty() || (i >= o && i + inner.len() <= o + outer.len())
    }

    #[test]
    fn test_absolute_with_port() {
        let s = b"http://example.com:8080/a/b?q=1";
        let u = parse_url(s).unwrap();
        assert_eq!(u.scheme, b"http");
        assert_eq!(u.host, b"example.com");
        assert_eq!(u.port, Some(&b"8080"[..]));
        assert_eq!(u.port_number(), Some(8080));
        assert_eq!(u.path, b"/a/b?q=1");
        for part in [u.scheme, u.host, u.port.unwrap(), u.path] {
            assert!(within(s, part));
        }
    }

    #[test]
    fn test_absolute_without_port() {
        let u = parse_url(b"http://example.com/").unwrap();
        assert_eq!(u.host, b"example.com");
        assert_eq!(u.port, None);
        assert_eq!(u.path, b"/");

        let u = parse_url(b"http://example.com").unwrap();
        assert_eq!(u.host, b"example.com");
        assert_eq!(u.path, b"");
    }

    #[test]
    fn test_path_only() {
        let u = parse_url(b"/index.html").unwrap();
        assert_eq!(u.path, b"/index.html");
        assert!(u.host.is_empty());

        let u = parse_url(b"/a:b").unwrap();
        assert_eq!(u.path, b"/a:b");

        let u = parse_url(b"*").unwrap();
        assert_eq!(u.path, b"*");
    }

    #[test]
    fn test_missing_slashes() {
        assert!(parse_url(b"http:example.com").is_none());
        assert!(parse_url(b"http:/x").is_none());
    }

    #[test]
    fn test_bad_port_number() {
        let u = parse_url(b"http://h:99999/").unwrap();
        assert_eq!(u.port, Some(&b"99999"[..]));
        assert_eq!(u.port_number(), None);
    }
}
