use url::Url;

/// Appends `segments` to the path of `base`, percent-encoding each one.
///
/// Identities and voice ids are arbitrary strings, so a `/`, `?` or `#`
/// inside one stays part of that segment.
pub(crate) fn join_path(base: &str, segments: &[&str]) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid base URL '{}': {}", base, e))?;
    url.path_segments_mut()
        .map_err(|_| format!("base URL '{}' cannot carry a path", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_to_root_and_prefixed_bases() {
        assert_eq!(
            join_path("http://cp:8080", &["voices", "alice"]).unwrap().as_str(),
            "http://cp:8080/voices/alice"
        );
        assert_eq!(
            join_path("http://cp:8080/api/", &["voices", "alice"])
                .unwrap()
                .as_str(),
            "http://cp:8080/api/voices/alice"
        );
    }

    #[test]
    fn reserved_characters_stay_inside_their_segment() {
        let url = join_path("http://cp", &["voices", "team/a#1?x"]).unwrap();
        assert_eq!(url.as_str(), "http://cp/voices/team%2Fa%231%3Fx");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
    }

    #[test]
    fn unusable_base_is_rejected() {
        assert!(join_path("not a url", &["voices"]).is_err());
        assert!(join_path("mailto:relay@example.com", &["voices"]).is_err());
    }
}
