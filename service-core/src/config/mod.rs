use crate::error::AppError;
use config::{Config as Cfg, Environment, File};
use serde::de::DeserializeOwned;

/// Load a configuration struct from layered sources.
///
/// Order (later wins): `.env` file (via dotenvy), the optional config file
/// named by `file` (format picked from its extension), then environment
/// variables `{env_prefix}__SECTION__KEY`.
pub fn load_section<T: DeserializeOwned>(file: &str, env_prefix: &str) -> Result<T, AppError> {
    dotenvy::dotenv().ok();

    let config = Cfg::builder()
        .add_source(File::with_name(file).required(false))
        .add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(config.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        name: String,
        #[serde(default = "default_port")]
        port: u16,
    }

    fn default_port() -> u16 {
        8080
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(file, "name = \"sessions\"\nport = 9090").expect("write config");

        let sample: Sample =
            load_section(file.path().to_str().expect("utf-8 path"), "SVC_CORE_TEST_FILE")
                .expect("load config");
        assert_eq!(sample.name, "sessions");
        assert_eq!(sample.port, 9090);
    }

    #[test]
    fn test_missing_file_is_optional() {
        let result: Result<Sample, AppError> =
            load_section("does-not-exist/configuration", "SVC_CORE_TEST_MISSING");
        // `name` has no default, so only deserialisation can fail here.
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }
}
