use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::crypt::Title;
use crate::err::HookError;
use crate::vfs::default_fallbacks;

/// The run configuration of a session.
///
/// ```json
/// {
///     "game": "th145",
///     "fileslist": ["data/script/stage1.nut"],
///     "fallbacks": { "dds": "png" },
///     "breakpoints": {
///         "0x4a1f30": { "th135_file_header": { "file_hash": "[esp+8]", "file_key": "esp+0xc" } }
///     }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// The game id.
    pub game: Title,
    /// Breakpoint sites by address.
    #[serde(default)]
    pub breakpoints: Map<String, Value>,
    /// The archive paths the game may open.
    #[serde(default)]
    pub fileslist: Vec<String>,
    /// Extension fallbacks for files without a replacement.
    #[serde(default = "default_fallbacks")]
    pub fallbacks: HashMap<String, String>,
}

impl RunConfig {
    /// Parses a run configuration.
    pub fn from_json(text: &str) -> Result<Self, HookError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads a run configuration from a parsed value.
    pub fn from_value(value: Value) -> Result<Self, HookError> {
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let c = RunConfig::from_json(r#"{ "game": "th135" }"#).unwrap();
        assert_eq!(c.game, Title::Th135);
        assert!(c.breakpoints.is_empty());
        assert!(c.fileslist.is_empty());
        assert_eq!(c.fallbacks.get("dds").map(String::as_str), Some("png"));
    }

    #[test]
    fn test_full() {
        let c = RunConfig::from_value(json!({
            "game": "th155",
            "fileslist": ["a.pl", "b.nut"],
            "fallbacks": {},
            "breakpoints": { "0x401000": { "th135_file_name": { "file_name": "eax" } } },
        }))
        .unwrap();
        assert_eq!(c.game, Title::Future(155));
        assert_eq!(c.fileslist, ["a.pl", "b.nut"]);
        assert!(c.fallbacks.is_empty());
        assert!(c.breakpoints.contains_key("0x401000"));
    }

    #[test]
    fn test_bad_game() {
        assert!(matches!(
            RunConfig::from_json(r#"{ "game": "th06" }"#),
            Err(HookError::Json(_))
        ));
        assert!(RunConfig::from_json("{}").is_err());
    }
}
