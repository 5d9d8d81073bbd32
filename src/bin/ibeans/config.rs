//! The optional properties configuration file.
//!
//! Lines are `key=value` (or `key: value`); blank lines and lines
//! starting with `#` or `!` are comments. Unknown keys are rejected so a
//! typo fails loudly at startup instead of silently running with
//! defaults.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct FileConfig {
    pub(crate) port: Option<u16>,
    pub(crate) wal_enable: Option<bool>,
    pub(crate) wal_dir: Option<PathBuf>,
    pub(crate) wal_files: Option<usize>,
}

impl FileConfig {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self> {
        let mut config = Self::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!')
            {
                continue;
            }

            let lineno = idx + 1;
            let (key, value) = line
                .split_once('=')
                .or_else(|| line.split_once(':'))
                .with_context(|| {
                    format!("line {lineno}: expected key=value")
                })?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "server.port" => {
                    config.port = Some(value.parse().with_context(|| {
                        format!("line {lineno}: invalid server.port")
                    })?);
                },
                "wal.enable" => {
                    config.wal_enable = Some(match value {
                        "true" => true,
                        "false" => false,
                        _ => bail!(
                            "line {lineno}: wal.enable must be true or false"
                        ),
                    });
                },
                "wal.dir" => config.wal_dir = Some(PathBuf::from(value)),
                "wal.files" => {
                    let n: usize = value.parse().with_context(|| {
                        format!("line {lineno}: invalid wal.files")
                    })?;
                    if n == 0 {
                        bail!("line {lineno}: wal.files must be at least 1");
                    }
                    config.wal_files = Some(n);
                },
                _ => bail!("line {lineno}: unrecognised key {key:?}"),
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_keys_with_comments() {
        let config = FileConfig::parse(
            "# queue server\n\
             server.port=11301\n\
             \n\
             ! durability\n\
             wal.enable: true\n\
             wal.dir = /var/lib/ibeans\n\
             wal.files=4\n",
        )
        .unwrap();

        assert_eq!(
            config,
            FileConfig {
                port: Some(11301),
                wal_enable: Some(true),
                wal_dir: Some(PathBuf::from("/var/lib/ibeans")),
                wal_files: Some(4),
            }
        );
    }

    #[test]
    fn empty_file_is_all_defaults() {
        assert_eq!(FileConfig::parse("").unwrap(), FileConfig::default());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(FileConfig::parse("server.prot=11300").is_err());
        assert!(FileConfig::parse("server.port=notaport").is_err());
        assert!(FileConfig::parse("wal.enable=yes").is_err());
        assert!(FileConfig::parse("wal.files=0").is_err());
        assert!(FileConfig::parse("just a line").is_err());
    }
}
