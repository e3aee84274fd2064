use url::Url;

/// Equivalent spellings of a feed URL.
///
/// Two fetch URLs that differ only in `http`/`https`, a trailing slash on the path,
/// or a leading `www.` host label are treated as the same feed. The first element is
/// always the input itself (trimmed), so callers can use the result directly in an
/// `IN (...)` lookup. Unparseable input yields just the trimmed string.
pub fn url_variants(raw: &str) -> Vec<String> {
    let trimmed = raw.trim();
    let mut variants = vec![trimmed.to_owned()];

    let Ok(url) = Url::parse(trimmed) else {
        return variants;
    };
    let Some(host) = url.host_str() else {
        return variants;
    };

    let other_host = match host.strip_prefix("www.") {
        Some(bare) => bare.to_owned(),
        None => format!("www.{host}"),
    };

    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let query = url.query().map(|q| format!("?{q}")).unwrap_or_default();
    let path = url.path();
    let other_path = match path.strip_suffix('/') {
        Some(stripped) => stripped.to_owned(),
        None => format!("{path}/"),
    };

    for scheme in ["http", "https"] {
        for h in [host, other_host.as_str()] {
            for p in [path, other_path.as_str()] {
                let candidate = format!("{scheme}://{h}{port}{p}{query}");
                if !variants.contains(&candidate) {
                    variants.push(candidate);
                }
            }
        }
    }

    variants
}
