use std::fs::{create_dir_all, File};
use std::io::{Read, Result, Write};
use std::path::{Path, PathBuf};

pub fn get_save_file_path(rom_path: &str) -> PathBuf {
    let path = Path::new(rom_path);
    let mut save_path = path.to_path_buf();
    save_path.set_extension("sav");
    save_path
}

pub fn load_sram(rom_path: &str) -> Result<Option<Vec<u8>>> {
    let save_path = get_save_file_path(rom_path);

    if !save_path.exists() {
        log::info!("no save file found, starting with fresh SRAM");
        return Ok(None);
    }

    let mut file = File::open(&save_path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    log::info!("loaded {} bytes from {}", data.len(), save_path.display());
    Ok(Some(data))
}

pub fn save_sram(rom_path: &str, data: &[u8]) -> Result<()> {
    let save_path = get_save_file_path(rom_path);

    if let Some(parent) = save_path.parent() {
        create_dir_all(parent)?;
    }

    let mut file = File::create(&save_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    log::info!("saved {} bytes to {}", data.len(), save_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_path_swaps_extension() {
        assert_eq!(
            get_save_file_path("roms/game.sfc"),
            PathBuf::from("roms/game.sav")
        );
    }
}
