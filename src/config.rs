use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Default per-file upload limit (50 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

/// Default LLM review budget (20 minutes)
pub const DEFAULT_LLM_TIMEOUT_MS: u64 = 1_200_000;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub llm: LlmConfig,
    pub extractor: ExtractorConfig,
    pub limits: LimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Exact origins or wildcard patterns such as `https://*.example.com`
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub binary_path: Option<PathBuf>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    pub max_file_size: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let extractor = ExtractorConfig {
            binary_path: env::var("PDF_EXTRACTOR_PATH").ok().map(PathBuf::from),
            url: env::var("PDF_EXTRACTOR_URL").ok(),
        };
        if extractor.binary_path.is_none() && extractor.url.is_none() {
            return Err("Either PDF_EXTRACTOR_PATH or PDF_EXTRACTOR_URL must be set".into());
        }

        let frontend_url = env::var("FRONTEND_URL").ok();
        let mut allowed_origins: Vec<String> = env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if let Some(frontend) = frontend_url {
            if !allowed_origins.contains(&frontend) {
                allowed_origins.push(frontend);
            }
        }

        Ok(Config {
            database_url,

            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .unwrap_or(8080),
            },

            cors: CorsConfig { allowed_origins },

            llm: LlmConfig {
                api_key: env::var("LLM_API_KEY").ok(),
                base_url: env::var("LLM_API_BASE_URL").ok(),
                model: env::var("LLM_MODEL").ok(),
                timeout_ms: env::var("LLM_TIMEOUT_MS")
                    .unwrap_or_else(|_| DEFAULT_LLM_TIMEOUT_MS.to_string())
                    .parse()
                    .unwrap_or(DEFAULT_LLM_TIMEOUT_MS),
                max_retries: env::var("LLM_MAX_RETRIES")
                    .unwrap_or_else(|_| "2".to_string())
                    .parse()
                    .unwrap_or(2),
            },

            extractor,

            limits: LimitConfig {
                max_file_size: env::var("MAX_FILE_SIZE")
                    .unwrap_or_else(|_| DEFAULT_MAX_FILE_SIZE.to_string())
                    .parse()
                    .unwrap_or(DEFAULT_MAX_FILE_SIZE),
            },
        })
    }
}
