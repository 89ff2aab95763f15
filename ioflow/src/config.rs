//! Validation of user-supplied configuration
//!
//! Everything here runs before the eBPF object is loaded, so a malformed
//! argument never leaves half-installed instrumentation behind.

use ioflow_common::KernelLayout;
use log::info;
use std::path::Path;

use crate::domain::ConfigError;

/// Default capacity of the record transport
pub const DEFAULT_CAPACITY: usize = 4096;

/// Parse a millisecond threshold: finite and non-negative
///
/// # Errors
/// Returns [`ConfigError::InvalidThreshold`] for anything else
pub fn parse_threshold(raw: &str) -> Result<f64, ConfigError> {
    match raw.trim().parse::<f64>() {
        Ok(ms) if ms.is_finite() && ms >= 0.0 => Ok(ms),
        _ => Err(ConfigError::InvalidThreshold(raw.to_string())),
    }
}

/// Parse a transport capacity (at least one record)
///
/// # Errors
/// Returns [`ConfigError::InvalidCapacity`] for zero; non-numeric input is
/// reported as a zero capacity
pub fn parse_capacity(raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(capacity) if capacity >= 1 => Ok(capacity),
        Ok(capacity) => Err(ConfigError::InvalidCapacity(capacity)),
        Err(_) => Err(ConfigError::InvalidCapacity(0)),
    }
}

/// Kernel struct offsets: defaults, overridden by the JSON file at `path`
///
/// Fields missing from the file keep their defaults; unknown fields are
/// rejected.
///
/// # Errors
/// Returns [`ConfigError::LayoutRead`] or [`ConfigError::LayoutParse`]
pub fn load_layout(path: Option<&Path>) -> Result<KernelLayout, ConfigError> {
    let Some(path) = path else {
        return Ok(KernelLayout::default());
    };

    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::LayoutRead { path: path.to_path_buf(), source })?;
    let layout = serde_json::from_str(&text)
        .map_err(|source| ConfigError::LayoutParse { path: path.to_path_buf(), source })?;
    info!("Loaded kernel layout overrides from {}", path.display());
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_threshold() {
        assert_eq!(parse_threshold("1").ok(), Some(1.0));
        assert_eq!(parse_threshold("0.2").ok(), Some(0.2));
        assert_eq!(parse_threshold(" 0 ").ok(), Some(0.0));
        assert!(parse_threshold("-0.5").is_err());
        assert!(parse_threshold("inf").is_err());
        assert!(parse_threshold("NaN").is_err());
        assert!(parse_threshold("fast").is_err());
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("4096").ok(), Some(4096));
        assert!(matches!(parse_capacity("0"), Err(ConfigError::InvalidCapacity(0))));
        assert!(parse_capacity("-1").is_err());
    }

    #[test]
    fn test_default_layout_without_file() {
        assert_eq!(load_layout(None).unwrap(), KernelLayout::default());
    }

    #[test]
    fn test_partial_layout_override() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "rq_disk": 160, "bio_disk": 16 }}"#).unwrap();

        let layout = load_layout(Some(file.path())).unwrap();
        assert_eq!(layout.rq_disk, 160);
        assert_eq!(layout.bio_disk, 16);
        assert_eq!(layout.file_f_op, KernelLayout::default().file_f_op);
    }

    #[test]
    fn test_layout_unknown_field_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{ "rq_disc": 160 }}"#).unwrap();
        assert!(matches!(
            load_layout(Some(file.path())),
            Err(ConfigError::LayoutParse { .. })
        ));
    }

    #[test]
    fn test_missing_layout_file() {
        let err = load_layout(Some(Path::new("/nonexistent/layout.json"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read layout file"));
    }
}
