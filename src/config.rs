//! Optional `serve` defaults loaded from a JSON5 file. The file only ever
//! supplies *defaults*: any flag given on the command line wins.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    pub addr: Option<String>,
    pub port: Option<u16>,
    pub file: Option<String>,
    pub sock: Option<String>,
    #[serde(default)]
    pub acl: Vec<String>,
}

impl Config {
    /// Loads a config file if `path` is given, otherwise returns defaults
    /// (a `serve` invocation with no `--config` relies entirely on its own
    /// flags).
    pub fn load(path: Option<&str>) -> Result<Self> {
        match path {
            None => Ok(Self::default()),
            Some(path) => {
                let text = fs::read_to_string(Path::new(path))
                    .with_context(|| format!("reading config file {path}"))?;
                serde_json5::from_str(&text)
                    .with_context(|| format!("parsing config file {path}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_path_yields_defaults() {
        let cfg = Config::load(None).unwrap();
        assert!(cfg.addr.is_none());
        assert!(cfg.acl.is_empty());
    }

    #[test]
    fn parses_a_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nbd-mirrord.json5");
        fs::write(&path, r#"{ addr: "127.0.0.1", port: 10900, acl: ["10.0.0.0/8"] }"#).unwrap();

        let cfg = Config::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(cfg.addr.as_deref(), Some("127.0.0.1"));
        assert_eq!(cfg.port, Some(10900));
        assert_eq!(cfg.acl, vec!["10.0.0.0/8".to_string()]);
    }
}
