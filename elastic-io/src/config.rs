//! Saved defaults for the elastic tool
//!
//! A `key=value` file under the platform config directory. Command-line
//! flags override anything read from here.

use elastic_stretch::{FormantMode, PitchMode, ThreadingMode};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Config {
    /// Crispness level, 0 to 5
    pub crispness: Option<u8>,
    pub threading: Option<ThreadingMode>,
    pub formant: Option<FormantMode>,
    pub pitch: Option<PitchMode>,
    /// Log verbosity, 0 to 3
    pub debug: Option<u8>,
}

impl Config {
    /// Load config from the default location
    ///
    /// Returns default config if file doesn't exist or can't be parsed.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn save(&self) -> io::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("elastic")
            .join("config.txt")
    }

    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "crispness" => match value.parse::<u8>() {
                    Ok(n) if n <= 5 => config.crispness = Some(n),
                    _ => tracing::warn!("Ignoring crispness value {:?}", value),
                },
                "threading" => {
                    config.threading = match value {
                        "auto" => Some(ThreadingMode::Auto),
                        "never" => Some(ThreadingMode::Never),
                        "always" => Some(ThreadingMode::Always),
                        _ => {
                            tracing::warn!("Ignoring threading value {:?}", value);
                            config.threading
                        }
                    }
                }
                "formant" => {
                    config.formant = match value {
                        "shifted" => Some(FormantMode::Shifted),
                        "preserved" => Some(FormantMode::Preserved),
                        _ => {
                            tracing::warn!("Ignoring formant value {:?}", value);
                            config.formant
                        }
                    }
                }
                "pitch" => {
                    config.pitch = match value {
                        "speed" => Some(PitchMode::HighSpeed),
                        "quality" => Some(PitchMode::HighQuality),
                        "consistency" => Some(PitchMode::HighConsistency),
                        _ => {
                            tracing::warn!("Ignoring pitch value {:?}", value);
                            config.pitch
                        }
                    }
                }
                "debug" => match value.parse::<u8>() {
                    Ok(n) => config.debug = Some(n.min(3)),
                    Err(_) => tracing::warn!("Ignoring debug value {:?}", value),
                },
                _ => {}
            }
        }

        config
    }

    fn serialize(&self) -> String {
        let mut lines = vec!["# elastic defaults".to_string()];

        if let Some(n) = self.crispness {
            lines.push(format!("crispness={}", n));
        }
        if let Some(t) = self.threading {
            let value = match t {
                ThreadingMode::Auto => "auto",
                ThreadingMode::Never => "never",
                ThreadingMode::Always => "always",
            };
            lines.push(format!("threading={}", value));
        }
        if let Some(f) = self.formant {
            let value = match f {
                FormantMode::Shifted => "shifted",
                FormantMode::Preserved => "preserved",
            };
            lines.push(format!("formant={}", value));
        }
        if let Some(p) = self.pitch {
            let value = match p {
                PitchMode::HighSpeed => "speed",
                PitchMode::HighQuality => "quality",
                PitchMode::HighConsistency => "consistency",
            };
            lines.push(format!("pitch={}", value));
        }
        if let Some(d) = self.debug {
            lines.push(format!("debug={}", d));
        }

        lines.join("\n")
    }
}
