//! Small helpers shared across modules.

/// Turn an identifier into a safe single path component.
///
/// Separators and other unsafe characters become `_`. Leading dots are
/// stripped so the result is never hidden or a parent reference. Returns
/// "unknown" when nothing usable remains.
pub fn sanitize_id(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let result = sanitized.trim_start_matches(['.', '-']);
    if result.is_empty() || result.contains("..") {
        "unknown".to_string()
    } else {
        result.to_string()
    }
}

/// Whether `name` can be joined onto a directory without escaping it.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_device_ids() {
        assert_eq!(sanitize_id("00008110-001A2B3C"), "00008110-001A2B3C");
        assert_eq!(sanitize_id("root@10.0.0.5:2222"), "root_10.0.0.5_2222");
        assert_eq!(sanitize_id("../etc"), "unknown");
        assert_eq!(sanitize_id("..."), "unknown");
        assert_eq!(sanitize_id(""), "unknown");
    }

    #[test]
    fn test_safe_component() {
        assert!(is_safe_component("dev-20250101T000000000Z"));
        assert!(!is_safe_component("../x"));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component(""));
    }
}
