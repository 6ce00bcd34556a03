//! Configuration documents written for the downstream services.
//!
//! Each document is a typed struct run through [`encode_json`], which refuses
//! to serialize values that would violate the schema the services expect.
//! The key names mirror what the AI, UI, security, scheduler and developer
//! tool services read at startup; the pipeline never reads them back.
//!
//! Each mode keeps a full set under its own document root (see
//! [`ProvisionConfig::documents_dir`](crate::config::ProvisionConfig::documents_dir)).

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::{Mode, ProvisionContext};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    /// `KEY=value` lines, systemd `EnvironmentFile=` compatible.
    Ini,
    /// cloud-init NoCloud data (`#cloud-config` YAML).
    CloudInit,
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentFormat::Json => write!(f, "json"),
            DocumentFormat::Ini => write!(f, "ini"),
            DocumentFormat::CloudInit => write!(f, "cloud-init"),
        }
    }
}

/// A rendered document and where it lands (root-relative).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDocument {
    pub path: String,
    pub format: DocumentFormat,
    pub content: String,
    pub mode: u32,
}

/// Schema check run before a document is encoded.
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

/// Validate then serialize as pretty JSON with a trailing newline.
pub fn encode_json<T: Serialize + Validate>(name: &str, value: &T) -> Result<String, ConfigError> {
    value.validate().map_err(|message| ConfigError::Encode {
        document: name.to_string(),
        message,
    })?;
    let mut out = serde_json::to_string_pretty(value).map_err(|e| ConfigError::Encode {
        document: name.to_string(),
        message: e.to_string(),
    })?;
    out.push('\n');
    Ok(out)
}

/// Render `KEY=value` lines in key order.
pub fn encode_env(values: &BTreeMap<String, String>) -> String {
    let mut out = String::from("# Managed by sonjayos; local edits are overwritten.\n");
    for (key, value) in values {
        if value.contains(char::is_whitespace) {
            out.push_str(&format!("{key}=\"{value}\"\n"));
        } else {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out
}

fn fraction(field: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{field} must be within [0, 1], got {value}"))
    }
}

fn percent(field: &str, value: f64) -> Result<(), String> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(format!("{field} must be within (0, 100], got {value}"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ai/llama_config.json
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelEntry {
    pub name: String,
    pub size: String,
    /// MB of RAM the model needs once loaded.
    pub memory_usage: u64,
    pub inference_speed: f64,
    pub quality_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlamaConfig {
    pub models: BTreeMap<String, ModelEntry>,
    pub default_model: String,
    /// Base URL of the Ollama API.
    pub ollama_host: String,
    pub max_memory_usage: f64,
    pub cache_size: u32,
    pub auto_model_switching: bool,
}

impl Validate for LlamaConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.models.contains_key(&self.default_model) {
            return Err(format!(
                "default_model '{}' is not one of the configured models",
                self.default_model
            ));
        }
        if self.max_memory_usage <= 0.0 {
            return Err("max_memory_usage must be positive".into());
        }
        fraction("max_memory_usage", self.max_memory_usage)?;
        for (key, model) in &self.models {
            fraction(&format!("models.{key}.quality_score"), model.quality_score)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ai/whisper_config.json
// ─────────────────────────────────────────────────────────────────────────────

pub const WHISPER_MODEL_SIZES: &[&str] = &["tiny", "base", "small", "medium", "large"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioCapture {
    pub sample_rate: u32,
    pub channels: u16,
    pub chunk_size: u32,
    /// Input device; `null` picks the system default.
    pub device_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recognition {
    pub language: String,
    pub model_size: String,
    pub temperature: f64,
    pub beam_size: u32,
    pub word_timestamps: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionLimits {
    /// Seconds.
    pub max_audio_length: u32,
    pub vad_threshold: f64,
    /// Seconds of silence that end an utterance.
    pub silence_timeout: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WhisperConfig {
    pub audio: AudioCapture,
    pub recognition: Recognition,
    pub performance: RecognitionLimits,
}

impl Validate for WhisperConfig {
    fn validate(&self) -> Result<(), String> {
        if !WHISPER_MODEL_SIZES.contains(&self.recognition.model_size.as_str()) {
            return Err(format!(
                "recognition.model_size '{}' is not one of {}",
                self.recognition.model_size,
                WHISPER_MODEL_SIZES.join(", ")
            ));
        }
        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err("audio.sample_rate and audio.channels must be > 0".into());
        }
        if self.recognition.beam_size == 0 {
            return Err("recognition.beam_size must be > 0".into());
        }
        fraction("recognition.temperature", self.recognition.temperature)?;
        fraction("performance.vad_threshold", self.performance.vad_threshold)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ai/embeddings_config.json
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingsConfig {
    pub model_name: String,
    pub batch_size: u32,
    pub max_length: u32,
    pub device: String,
    pub cache_size: u32,
    pub supported_extensions: Vec<String>,
    /// Characters per indexed chunk.
    pub chunk_size: u32,
    pub overlap_size: u32,
}

impl Validate for EmbeddingsConfig {
    fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 || self.max_length == 0 {
            return Err("batch_size and max_length must be > 0".into());
        }
        if self.overlap_size >= self.chunk_size {
            return Err(format!(
                "overlap_size ({}) must be smaller than chunk_size ({})",
                self.overlap_size, self.chunk_size
            ));
        }
        extensions("supported_extensions", &self.supported_extensions)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// dev_tools/code_completion_config.json
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub enabled: bool,
    pub max_suggestions: u32,
    pub confidence_threshold: f64,
    pub cache_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageSupport {
    pub extensions: Vec<String>,
    pub keywords: Vec<String>,
    pub builtins: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionModels {
    pub primary_model: String,
    pub fallback_model: String,
    pub context_length: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeCompletionConfig {
    pub completion: Completion,
    pub languages: BTreeMap<String, LanguageSupport>,
    pub ai_models: CompletionModels,
}

impl Validate for CodeCompletionConfig {
    fn validate(&self) -> Result<(), String> {
        if self.completion.max_suggestions == 0 {
            return Err("completion.max_suggestions must be > 0".into());
        }
        fraction(
            "completion.confidence_threshold",
            self.completion.confidence_threshold,
        )?;
        fraction("ai_models.temperature", self.ai_models.temperature)?;
        if self.ai_models.primary_model.is_empty() || self.ai_models.fallback_model.is_empty() {
            return Err("ai_models.primary_model and fallback_model must be set".into());
        }
        for (name, language) in &self.languages {
            extensions(&format!("languages.{name}.extensions"), &language.extensions)?;
        }
        Ok(())
    }
}

fn extensions(field: &str, values: &[String]) -> Result<(), String> {
    if values.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    match values.iter().find(|ext| !ext.starts_with('.') || ext.len() < 2) {
        Some(bad) => Err(format!("{field} entry '{bad}' is not a '.ext' suffix")),
        None => Ok(()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ui/theme_config.json
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentAdaptation {
    pub brightness_threshold: f64,
    pub contrast_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThemeConfig {
    pub auto_theme_switching: bool,
    pub learning_enabled: bool,
    pub brightness_adaptation: bool,
    pub time_based_themes: BTreeMap<String, String>,
    pub activity_themes: BTreeMap<String, String>,
    pub environment_adaptation: EnvironmentAdaptation,
}

impl Validate for ThemeConfig {
    fn validate(&self) -> Result<(), String> {
        fraction(
            "environment_adaptation.brightness_threshold",
            self.environment_adaptation.brightness_threshold,
        )?;
        fraction(
            "environment_adaptation.contrast_threshold",
            self.environment_adaptation.contrast_threshold,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// security/ai_security_config.json
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Monitoring {
    pub enabled: bool,
    pub check_interval: u64,
    pub log_retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreatDetection {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    /// MB transferred per check interval.
    pub network_threshold: u64,
    /// Files per minute.
    pub file_access_threshold: u64,
    pub process_threshold: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alerts {
    pub email_notifications: bool,
    pub desktop_notifications: bool,
    pub log_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Encryption {
    pub enabled: bool,
    pub algorithm: String,
    pub key_rotation_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityConfig {
    pub monitoring: Monitoring,
    pub threat_detection: ThreatDetection,
    pub ai_models: BTreeMap<String, bool>,
    pub alerts: Alerts,
    pub encryption: Encryption,
}

impl Validate for SecurityConfig {
    fn validate(&self) -> Result<(), String> {
        if self.monitoring.check_interval == 0 {
            return Err("monitoring.check_interval must be > 0".into());
        }
        percent(
            "threat_detection.cpu_threshold",
            self.threat_detection.cpu_threshold,
        )?;
        percent(
            "threat_detection.memory_threshold",
            self.threat_detection.memory_threshold,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// kernel/scheduler_config.json
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scheduling {
    pub enabled: bool,
    pub check_interval: u64,
    pub decision_threshold: f64,
    pub learning_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Optimization {
    pub cpu_boost_threshold: f64,
    pub memory_boost_threshold: f64,
    pub priority_boost_factor: f64,
    pub throttle_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerConfig {
    pub scheduling: Scheduling,
    pub optimization: Optimization,
    pub ai_models: BTreeMap<String, bool>,
    pub process_categories: BTreeMap<String, Vec<String>>,
}

impl Validate for SchedulerConfig {
    fn validate(&self) -> Result<(), String> {
        if self.scheduling.check_interval == 0 {
            return Err("scheduling.check_interval must be > 0".into());
        }
        fraction("scheduling.decision_threshold", self.scheduling.decision_threshold)?;
        fraction(
            "optimization.cpu_boost_threshold",
            self.optimization.cpu_boost_threshold,
        )?;
        fraction(
            "optimization.memory_boost_threshold",
            self.optimization.memory_boost_threshold,
        )?;
        fraction(
            "optimization.throttle_threshold",
            self.optimization.throttle_threshold,
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builders
// ─────────────────────────────────────────────────────────────────────────────

fn string_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn flag_map(keys: &[&str], value: bool) -> BTreeMap<String, bool> {
    keys.iter().map(|k| (k.to_string(), value)).collect()
}

pub fn llama_config(ctx: &ProvisionContext) -> LlamaConfig {
    let mut models = BTreeMap::new();
    models.insert(
        "llama3.1-8b".to_string(),
        ModelEntry {
            name: "llama3.1:8b".into(),
            size: "8B".into(),
            memory_usage: 8000,
            inference_speed: 50.0,
            quality_score: 0.85,
        },
    );
    models.insert(
        "llama3.1-70b".to_string(),
        ModelEntry {
            name: "llama3.1:70b".into(),
            size: "70B".into(),
            memory_usage: 40000,
            inference_speed: 15.0,
            quality_score: 0.95,
        },
    );

    LlamaConfig {
        models,
        default_model: "llama3.1-8b".into(),
        ollama_host: ctx.config.ollama_url(),
        max_memory_usage: ctx.settings.model_memory_fraction,
        cache_size: 1000,
        auto_model_switching: ctx.mode == Mode::Production,
    }
}

pub fn whisper_config() -> WhisperConfig {
    WhisperConfig {
        audio: AudioCapture {
            sample_rate: 16000,
            channels: 1,
            chunk_size: 1024,
            device_index: None,
        },
        recognition: Recognition {
            language: "zh".into(),
            model_size: "base".into(),
            temperature: 0.0,
            beam_size: 5,
            word_timestamps: false,
        },
        performance: RecognitionLimits {
            max_audio_length: 30,
            vad_threshold: 0.5,
            silence_timeout: 2.0,
        },
    }
}

pub fn embeddings_config() -> EmbeddingsConfig {
    EmbeddingsConfig {
        model_name: "sentence-transformers/paraphrase-multilingual-MiniLM-L12-v2".into(),
        batch_size: 32,
        max_length: 512,
        device: "auto".into(),
        cache_size: 10000,
        supported_extensions: strings(&[
            ".txt", ".md", ".py", ".js", ".html", ".css", ".json", ".xml",
        ]),
        chunk_size: 1000,
        overlap_size: 200,
    }
}

pub fn code_completion_config(ctx: &ProvisionContext) -> CodeCompletionConfig {
    fn language(extensions: &[&str], keywords: &[&str], builtins: &[&str]) -> LanguageSupport {
        LanguageSupport {
            extensions: strings(extensions),
            keywords: strings(keywords),
            builtins: strings(builtins),
        }
    }
    let languages = BTreeMap::from([
        (
            "python".to_string(),
            language(
                &[".py"],
                &["def", "class", "import", "from", "if", "for", "while", "try", "except"],
                &["print", "len", "str", "int", "float", "list", "dict", "tuple", "set"],
            ),
        ),
        (
            "javascript".to_string(),
            language(
                &[".js", ".jsx", ".ts", ".tsx"],
                &["function", "class", "import", "export", "if", "for", "while", "try", "catch"],
                &["console", "document", "window", "setTimeout", "setInterval", "fetch"],
            ),
        ),
        (
            "cpp".to_string(),
            language(
                &[".cpp", ".c", ".h", ".hpp"],
                &["int", "float", "double", "char", "bool", "void", "class", "struct", "namespace"],
                &["cout", "cin", "endl", "string", "vector", "map", "set"],
            ),
        ),
        (
            "java".to_string(),
            language(
                &[".java"],
                &["public", "private", "protected", "class", "interface", "extends", "implements"],
                &["System", "String", "Integer", "ArrayList", "HashMap", "Scanner"],
            ),
        ),
    ]);

    CodeCompletionConfig {
        completion: Completion {
            enabled: true,
            max_suggestions: 5,
            confidence_threshold: 0.7,
            cache_size: 1000,
        },
        languages,
        ai_models: CompletionModels {
            // The first pulled model is the one guaranteed to be local.
            primary_model: ctx
                .config
                .packages
                .ollama_models
                .first()
                .cloned()
                .unwrap_or_else(|| "llama3.1:8b".into()),
            fallback_model: "codellama:7b".into(),
            context_length: 2048,
            temperature: 0.2,
        },
    }
}

pub fn theme_config(ctx: &ProvisionContext) -> ThemeConfig {
    ThemeConfig {
        auto_theme_switching: true,
        learning_enabled: !ctx.settings.mock_ai,
        brightness_adaptation: true,
        time_based_themes: string_map(&[
            ("morning", "light_work"),
            ("afternoon", "light_work"),
            ("evening", "dark_work"),
            ("night", "dark_reading"),
        ]),
        activity_themes: string_map(&[
            ("work", "light_work"),
            ("coding", "coding"),
            ("reading", "light_reading"),
            ("entertainment", "entertainment"),
        ]),
        environment_adaptation: EnvironmentAdaptation {
            brightness_threshold: 0.5,
            contrast_threshold: 0.3,
        },
    }
}

pub fn security_config(ctx: &ProvisionContext) -> SecurityConfig {
    let s = &ctx.settings;
    SecurityConfig {
        monitoring: Monitoring {
            enabled: true,
            check_interval: s.monitor_interval_secs,
            log_retention_days: 30,
        },
        threat_detection: ThreatDetection {
            cpu_threshold: s.cpu_threshold,
            memory_threshold: s.memory_threshold,
            network_threshold: 1000,
            file_access_threshold: 1000,
            process_threshold: 200,
        },
        ai_models: flag_map(
            &["anomaly_detection", "behavior_analysis", "threat_classification"],
            !s.mock_ai,
        ),
        alerts: Alerts {
            email_notifications: false,
            desktop_notifications: true,
            log_file: format!(
                "/{}/security.log",
                ctx.config.layout.log_dir.trim_matches('/')
            ),
        },
        encryption: Encryption {
            enabled: true,
            algorithm: "AES-256".into(),
            key_rotation_days: 30,
        },
    }
}

pub fn scheduler_config(ctx: &ProvisionContext) -> SchedulerConfig {
    let s = &ctx.settings;
    let categories = [
        ("interactive", &["gnome", "firefox", "code", "terminal"][..]),
        ("background", &["systemd", "dbus", "NetworkManager"][..]),
        ("compute_intensive", &["gcc", "make", "python", "node"][..]),
        ("io_intensive", &["cp", "mv", "rsync", "dd"][..]),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.iter().map(|p| p.to_string()).collect()))
    .collect();

    SchedulerConfig {
        scheduling: Scheduling {
            enabled: true,
            check_interval: (s.monitor_interval_secs / 6).max(1),
            decision_threshold: 0.7,
            learning_enabled: !s.mock_ai,
        },
        optimization: Optimization {
            cpu_boost_threshold: 0.8,
            memory_boost_threshold: 0.85,
            priority_boost_factor: 1.5,
            throttle_threshold: 0.9,
        },
        ai_models: flag_map(
            &[
                "cpu_prediction",
                "memory_prediction",
                "priority_optimization",
                "load_balancing",
            ],
            !s.mock_ai,
        ),
        process_categories: categories,
    }
}

/// The document set for `ctx.mode`, under that mode's document root.
pub fn mode_documents(ctx: &ProvisionContext) -> Result<Vec<ConfigDocument>, ConfigError> {
    let dir = ctx.config.documents_dir(ctx.mode);
    // Access to security/ is gated by its directory.
    let json = |rel: &str, content: String| ConfigDocument {
        path: format!("{dir}/{rel}"),
        format: DocumentFormat::Json,
        content,
        mode: 0o644,
    };

    Ok(vec![
        json(
            "ai/llama_config.json",
            encode_json("ai/llama_config.json", &llama_config(ctx))?,
        ),
        json(
            "ai/whisper_config.json",
            encode_json("ai/whisper_config.json", &whisper_config())?,
        ),
        json(
            "ai/embeddings_config.json",
            encode_json("ai/embeddings_config.json", &embeddings_config())?,
        ),
        json(
            "ui/theme_config.json",
            encode_json("ui/theme_config.json", &theme_config(ctx))?,
        ),
        json(
            "security/ai_security_config.json",
            encode_json("security/ai_security_config.json", &security_config(ctx))?,
        ),
        json(
            "kernel/scheduler_config.json",
            encode_json("kernel/scheduler_config.json", &scheduler_config(ctx))?,
        ),
        json(
            "dev_tools/code_completion_config.json",
            encode_json(
                "dev_tools/code_completion_config.json",
                &code_completion_config(ctx),
            )?,
        ),
        ConfigDocument {
            path: format!("{dir}/sonjayos.env"),
            format: DocumentFormat::Ini,
            content: encode_env(&ctx.environment()),
            mode: 0o644,
        },
    ])
}

/// Every document the configuration stage materializes, in write order.
///
/// Both modes' sets are written whatever the selected mode, so switching
/// modes never rewrites what the other mode's services read.
pub fn service_documents(ctx: &ProvisionContext) -> Result<Vec<ConfigDocument>, ConfigError> {
    let mut docs = Vec::new();
    for mode in Mode::ALL {
        docs.extend(mode_documents(&ctx.with_mode(mode))?);
    }
    Ok(docs)
}
