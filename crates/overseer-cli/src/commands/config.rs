use super::{json_pretty, EXIT_SUCCESS};
use overseer_core::SupervisorConfig;
use std::path::Path;

pub fn run(config: &SupervisorConfig, write: Option<&Path>, json: bool) -> Result<u8, String> {
    if let Some(path) = write {
        config.save(path).map_err(|e| e.to_string())?;
        println!("wrote configuration to {}", path.display());
        return Ok(EXIT_SUCCESS);
    }

    if json {
        println!("{}", json_pretty(config)?);
    } else {
        print!("{}", config.to_toml().map_err(|e| e.to_string())?);
    }
    Ok(EXIT_SUCCESS)
}
