use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        self.pipeline.validate()?;
        self.overlay.validate()?;
        if self.predictor.embedding_dim == 0 {
            return Err("predictor.embedding_dim must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_index_file() -> PathBuf {
    PathBuf::from("./index.html")
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn get_shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_image_quality")]
    pub image_quality: u8,
    #[serde(default = "default_max_inflight_frames")]
    pub max_inflight_frames: usize,
}

fn default_image_quality() -> u8 {
    50
}

fn default_max_inflight_frames() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            image_quality: default_image_quality(),
            max_inflight_frames: default_max_inflight_frames(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.image_quality) {
            return Err(format!(
                "pipeline.image_quality must be within 1..=100, got {}",
                self.image_quality
            ));
        }
        if self.max_inflight_frames == 0 {
            return Err("pipeline.max_inflight_frames must be greater than zero".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OverlayConfig {
    #[serde(default = "default_line_thickness")]
    pub line_thickness: u32,
    #[serde(default = "default_draw_text")]
    pub draw_text: bool,
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default = "default_font_scale")]
    pub font_scale: f32,
    /// Fixed palette size. When unset the palette has one color per tree label.
    #[serde(default)]
    pub num_colors: Option<usize>,
}

fn default_line_thickness() -> u32 {
    3
}

fn default_draw_text() -> bool {
    true
}

fn default_font_scale() -> f32 {
    20.0
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            line_thickness: default_line_thickness(),
            draw_text: default_draw_text(),
            font_path: None,
            font_scale: default_font_scale(),
            num_colors: None,
        }
    }
}

impl OverlayConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.line_thickness == 0 {
            return Err("overlay.line_thickness must be greater than zero".to_string());
        }
        if self.num_colors == Some(0) {
            return Err("overlay.num_colors must be greater than zero when set".to_string());
        }
        if let Some(path) = &self.font_path {
            if !path.exists() {
                return Err(format!("Font file not found: {:?}", path));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PredictorConfig {
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,
}

fn default_embedding_dim() -> usize {
    512
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            embedding_dim: default_embedding_dim(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("TS")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    if let Err(e) = config.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
