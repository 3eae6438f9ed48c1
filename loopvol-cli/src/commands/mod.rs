//! CLI command implementations

use anyhow::Result;
use std::collections::HashMap;

pub mod volume;

/// Parse `KEY=VALUE` pairs given with `-o`.
pub fn parse_opts(opts: &[String]) -> Result<HashMap<String, String>> {
    opts.iter()
        .map(|opt| {
            let parts: Vec<&str> = opt.splitn(2, '=').collect();
            if parts.len() != 2 || parts[0].is_empty() {
                return Err(anyhow::anyhow!("Invalid option format: {}", opt));
            }
            Ok((parts[0].to_string(), parts[1].to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_opts() {
        let opts = parse_opts(&["size=1G".to_string(), "mode=0750".to_string()]).unwrap();
        assert_eq!(opts.get("size").map(String::as_str), Some("1G"));
        assert_eq!(opts.get("mode").map(String::as_str), Some("0750"));
    }

    #[test]
    fn test_parse_opts_keeps_equals_in_value() {
        let opts = parse_opts(&["fs=a=b".to_string()]).unwrap();
        assert_eq!(opts.get("fs").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn test_parse_opts_rejects_malformed() {
        assert!(parse_opts(&["size".to_string()]).is_err());
        assert!(parse_opts(&["=1G".to_string()]).is_err());
    }
}
