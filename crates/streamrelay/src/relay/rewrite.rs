// Manifest rewriting: route every URI line of a playlist back through the relay.

use url::Url;

use super::endpoint::RelayEndpoint;

/// True when a response should be treated as an HLS playlist.
pub fn is_manifest(content_type: Option<&str>, target: &Url) -> bool {
    let by_type = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("mpegurl"))
        .unwrap_or(false);
    by_type || target.path().to_ascii_lowercase().ends_with(".m3u8")
}

/// Rewrite every URI line of `body` to an absolute relayed URL.
///
/// Comment and blank lines are kept byte for byte, and so are lines that cannot be
/// resolved against `base`. The number and order of lines never change.
pub fn rewrite_manifest(body: &str, base: &Url, endpoint: &RelayEndpoint) -> String {
    body.split('\n')
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return line.to_string();
            }
            match base.join(trimmed) {
                Ok(absolute) => endpoint.wrap(absolute.as_str()),
                Err(_) => line.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n\n#EXTINF:10.0,\nseg0.ts\n#EXTINF:10.0,\n/abs/seg1.ts?sig=1\n#EXTINF:4.0,\nhttps://other.example.com/seg2.ts\n#EXT-X-ENDLIST\n";

    fn endpoint() -> RelayEndpoint {
        RelayEndpoint::from_origin("http://relay.local").unwrap()
    }

    #[test]
    fn keeps_line_count_and_order() {
        let base = Url::parse("https://cdn.example.com/vod/index.m3u8").unwrap();
        let rewritten = rewrite_manifest(MEDIA, &base, &endpoint());

        let before: Vec<&str> = MEDIA.split('\n').collect();
        let after: Vec<&str> = rewritten.split('\n').collect();
        assert_eq!(before.len(), after.len());

        for (original, new) in before.iter().zip(&after) {
            if original.trim().is_empty() || original.starts_with('#') {
                assert_eq!(original, new);
            } else {
                assert!(new.starts_with("http://relay.local/proxy?url="), "{new}");
            }
        }
    }

    #[test]
    fn resolves_relative_and_absolute_lines() {
        let base = Url::parse("https://cdn.example.com/vod/index.m3u8").unwrap();
        let rewritten = rewrite_manifest(MEDIA, &base, &endpoint());
        let targets: Vec<String> = rewritten
            .lines()
            .filter_map(RelayEndpoint::unwrap_target)
            .collect();
        assert_eq!(
            targets,
            vec![
                "https://cdn.example.com/vod/seg0.ts",
                "https://cdn.example.com/abs/seg1.ts?sig=1",
                "https://other.example.com/seg2.ts",
            ]
        );
    }

    #[test]
    fn unresolvable_lines_pass_through() {
        let base = Url::parse("https://cdn.example.com/vod/index.m3u8").unwrap();
        let body = "#EXTM3U\nhttp://[::1\n";
        assert_eq!(rewrite_manifest(body, &base, &endpoint()), body);
    }

    #[test]
    fn manifest_detection() {
        let ts = Url::parse("https://cdn.example.com/a/seg.ts").unwrap();
        let m3u8 = Url::parse("https://cdn.example.com/a/INDEX.M3U8?x=1").unwrap();
        assert!(is_manifest(Some("application/vnd.apple.mpegurl"), &ts));
        assert!(is_manifest(Some("audio/x-mpegURL"), &ts));
        assert!(is_manifest(None, &m3u8));
        assert!(!is_manifest(Some("video/mp2t"), &ts));
    }
}
