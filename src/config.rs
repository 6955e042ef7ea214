//! Configuração do Carrossel carregada a partir de `carrossel.toml`.
//!
//! A struct [`CarrosselConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `CARROSSEL_DATA_DIR` tem precedência sobre o arquivo.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;

/// Configuração de nível superior carregada de `carrossel.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CarrosselConfig {
    /// Diretório onde os arquivos de estado são gravados.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Intervalo em horas entre execuções automáticas do batch de apelação.
    #[serde(default = "default_appeal_interval_hours")]
    pub appeal_interval_hours: u64,

    /// Máximo de rodadas de apelação por perfil antes de marcá-lo esgotado.
    #[serde(default = "default_max_appeal_attempts")]
    pub max_appeal_attempts: u32,

    /// Atraso em segundos entre rodadas de apelação.
    #[serde(default = "default_appeal_retry_delay_secs")]
    pub appeal_retry_delay_secs: u64,

    /// Janela de retrospecção em dias para detecção de conteúdo duplicado.
    #[serde(default = "default_dedup_lookback_days")]
    pub dedup_lookback_days: u32,

    /// Duração padrão em horas de uma restrição quando o executor não informa.
    #[serde(default = "default_restriction_default_hours")]
    pub restriction_default_hours: i64,

    /// Período do tick do agendador em segundos.
    #[serde(default = "default_scheduler_tick_secs")]
    pub scheduler_tick_secs: u64,
}

// Valor padrão para o diretório de dados: "./carrossel-data".
fn default_data_dir() -> PathBuf {
    PathBuf::from("./carrossel-data")
}

// Valor padrão para o intervalo de apelação: 24 horas.
fn default_appeal_interval_hours() -> u64 {
    24
}

// Valor padrão para rodadas máximas de apelação: 3.
fn default_max_appeal_attempts() -> u32 {
    3
}

// Valor padrão para o atraso entre rodadas: 30 segundos.
fn default_appeal_retry_delay_secs() -> u64 {
    30
}

// Valor padrão para a janela de duplicados: 30 dias.
fn default_dedup_lookback_days() -> u32 {
    30
}

// Valor padrão para a duração de restrição: 24 horas.
fn default_restriction_default_hours() -> i64 {
    24
}

// Valor padrão para o tick do agendador: 60 segundos.
fn default_scheduler_tick_secs() -> u64 {
    60
}

impl Default for CarrosselConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            appeal_interval_hours: default_appeal_interval_hours(),
            max_appeal_attempts: default_max_appeal_attempts(),
            appeal_retry_delay_secs: default_appeal_retry_delay_secs(),
            dedup_lookback_days: default_dedup_lookback_days(),
            restriction_default_hours: default_restriction_default_hours(),
            scheduler_tick_secs: default_scheduler_tick_secs(),
        }
    }
}

impl CarrosselConfig {
    /// Carrega a configuração de `carrossel.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("carrossel.toml"))
    }

    /// Carrega a configuração de um caminho específico.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<CarrosselConfig>(&contents)?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(dir) = std::env::var("CARROSSEL_DATA_DIR")
            && !dir.is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}
