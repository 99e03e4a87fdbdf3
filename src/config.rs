use anyhow::{Context, Result};
use bt1bridge_lib::telemetry::FieldMap;
use std::path::Path;

/// Reads a replacement telemetry field table from a YAML list of field specs.
pub fn load_field_map(path: &Path) -> Result<FieldMap> {
    log::debug!("Loading field map from {path:?}");
    let file = std::fs::File::open(path)
        .with_context(|| format!("Cannot open field map file {path:?}"))?;
    let field_map: FieldMap = serde_yaml::from_reader(&file)
        .with_context(|| format!("Cannot read field map from file: {path:?}"))?;
    log::info!(
        "Loaded field map from {path:?}, payload must cover {} bytes",
        field_map.required_len()
    );
    Ok(field_map)
}

/// The built-in table unless a file is given.
pub fn field_map_or_default(path: Option<&Path>) -> Result<FieldMap> {
    match path {
        Some(path) => load_field_map(path),
        None => Ok(FieldMap::default()),
    }
}
