use std::path::PathBuf;

use async_trait::async_trait;

use crate::midi::registry::model::{LoadError, PumpRegistry, RegistryLayout};

const FIELDS_PER_ROW: usize = 2;

/// Where the pump table comes from.
#[async_trait]
pub trait PumpSource: Send + Sync {
    async fn read(&self) -> Result<String, LoadError>;

    fn describe(&self) -> String;

    async fn load(&self, layout: &RegistryLayout) -> Result<PumpRegistry, LoadError> {
        let text = self.read().await?;
        PumpRegistry::from_rows(&parse_rows(&text)?, layout)
    }
}

pub struct CsvFile {
    path: PathBuf,
}

impl CsvFile {
    pub fn new<P: Into<PathBuf>>(path: P) -> CsvFile {
        CsvFile { path: path.into() }
    }
}

#[async_trait]
impl PumpSource for CsvFile {
    async fn read(&self) -> Result<String, LoadError> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Trims a field and drops one pair of surrounding double quotes. Numeric
/// fields never need embedded commas or escaped quotes.
fn unquote(field: &str) -> &str {
    let field = field.trim();
    field
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map(str::trim)
        .unwrap_or(field)
}

/// Parses headerless `pump_index, duration_ms` rows. Any bad row fails the
/// whole table.
pub fn parse_rows(text: &str) -> Result<Vec<(u32, u64)>, LoadError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_row(idx + 1, line))
        .collect()
}

fn parse_row(row: usize, line: &str) -> Result<(u32, u64), LoadError> {
    let malformed = |reason: String| LoadError::Malformed { row, reason };

    let fields: Vec<&str> = line.split(',').map(unquote).collect();
    if fields.len() != FIELDS_PER_ROW {
        return Err(malformed(format!(
            "expected {FIELDS_PER_ROW} fields, got {}",
            fields.len()
        )));
    }

    let pump = fields[0]
        .parse::<u32>()
        .map_err(|e| malformed(format!("pump index {:?}: {e}", fields[0])))?;
    let duration = fields[1]
        .parse::<u64>()
        .map_err(|e| malformed(format!("duration {:?}: {e}", fields[1])))?;

    log::info!("pump: {pump} with duration: {duration} ms");
    Ok((pump, duration))
}
