use {
    std::env::var,
    tracing::Level,
    tracing_subscriber::{
        prelude::*,
        filter::filter_fn,
    },
    serde::{Serialize, de::DeserializeOwned},
    config::{Config, ConfigError},
};

pub fn init_logging() {
    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish()
        .with(filter_fn(|metadata| {
            if metadata.target().starts_with("reqwest") || metadata.target().starts_with("hyper") {
                metadata.level() > &Level::INFO
            } else {
                true
            }
        }))
        .init();
}

pub fn config_path() -> String {
    var("PIPELINE_CONFIG_PATH").unwrap_or("./config.toml".to_owned())
}

pub fn load_settings<T>() -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned + Default,
{
    load_settings_from(&config_path())
}

// the file may be missing and may set any subset of keys, nested tables included:
// everything it does not mention keeps the value from `T::default()`
pub fn load_settings_from<T>(path: &str) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned + Default,
{
    Config::builder()
        .add_source(Config::try_from(&T::default())?)
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("PIPELINE").separator("__").try_parsing(true))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use {
        std::{env, fs},
        serde::Deserialize,
        tempfile::tempdir,
        super::*,
    };

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct Adjustments {
        sharpness: f32,
        contrast: f32,
    }

    #[derive(Serialize, Deserialize, Debug)]
    #[serde(default)]
    struct TestSettings {
        steps: u32,
        prompt: String,
        seed: Option<u64>,
        adjustments: Adjustments,
    }

    impl Default for TestSettings {
        fn default() -> Self {
            Self {
                steps: 30,
                prompt: "a lake".to_owned(),
                seed: None,
                adjustments: Adjustments {
                    sharpness: 1.15,
                    contrast: 1.05,
                },
            }
        }
    }

    #[derive(Serialize, Deserialize, Debug)]
    #[serde(default)]
    struct EnvSettings {
        refiner: Adjustments,
    }

    impl Default for EnvSettings {
        fn default() -> Self {
            Self {
                refiner: Adjustments {
                    sharpness: 1.10,
                    contrast: 1.03,
                },
            }
        }
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let settings: TestSettings = load_settings_from(path.to_str().unwrap()).unwrap();

        assert_eq!(settings.steps, 30);
        assert_eq!(settings.prompt, "a lake");
        assert_eq!(settings.seed, None);
        assert_eq!(settings.adjustments, TestSettings::default().adjustments);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "steps = 12\nseed = 42\n").unwrap();

        let settings: TestSettings = load_settings_from(path.to_str().unwrap()).unwrap();

        assert_eq!(settings.steps, 12);
        assert_eq!(settings.seed, Some(42));
        assert_eq!(settings.prompt, "a lake");
    }

    #[test]
    fn single_nested_key_keeps_sibling_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[adjustments]\nsharpness = 1.3\n").unwrap();

        let settings: TestSettings = load_settings_from(path.to_str().unwrap()).unwrap();

        assert_eq!(settings.adjustments.sharpness, 1.3);
        assert_eq!(settings.adjustments.contrast, 1.05);
    }

    #[test]
    fn environment_overrides_single_nested_key() {
        env::set_var("PIPELINE__REFINER__SHARPNESS", "1.4");

        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let settings: EnvSettings = load_settings_from(path.to_str().unwrap()).unwrap();

        env::remove_var("PIPELINE__REFINER__SHARPNESS");

        assert_eq!(settings.refiner.sharpness, 1.4);
        assert_eq!(settings.refiner.contrast, 1.03);
    }
}
