mod apu;
mod bus;
mod cartridge;
mod clock;
mod cpu;
mod cpu_bus;
mod cpu_core;
mod debug_flags;
mod dma;
mod emulator;
mod input;
mod interrupts;
mod ppu;
mod sram;

use emulator::Emulator;
use std::path::{Path, PathBuf};
use std::process;

fn resolve_rom_path(arg: &str) -> Result<PathBuf, String> {
    // 1) Direct path
    let direct = PathBuf::from(arg);
    if direct.exists() {
        return Ok(direct);
    }

    // 2) Try with common extensions, directly and under roms/
    let exts = ["sfc", "smc"];
    for base in [Path::new("").join(arg), Path::new("roms").join(arg)] {
        if base.exists() {
            return Ok(base);
        }
        for ext in exts {
            let mut candidate = base.clone();
            if candidate.extension().is_none() {
                candidate.set_extension(ext);
            }
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }

    Err(format!("ROM not found: {}", arg))
}

fn parse_u32_hex_or_dec(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(stripped) = s.strip_prefix("0x") {
        u32::from_str_radix(stripped, 16).ok()
    } else {
        s.parse().ok()
    }
}

struct Options {
    rom: PathBuf,
    frames: u64,
    seconds: Option<f64>,
    dump_wram: Option<(u32, u32)>,
}

fn parse_args() -> Result<Options, String> {
    let mut args = std::env::args().skip(1);
    let mut rom = None;
    let mut frames: u64 = 60;
    let mut seconds = None;
    let mut dump_start = None;
    let mut dump_len = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                frames = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or("--frames takes a number")?;
            }
            "--seconds" => {
                seconds = Some(
                    args.next()
                        .and_then(|v| v.parse().ok())
                        .ok_or("--seconds takes a number")?,
                );
            }
            "--dump-wram" => {
                dump_start = args.next().as_deref().and_then(parse_u32_hex_or_dec);
                dump_len = args.next().as_deref().and_then(parse_u32_hex_or_dec);
                if dump_start.is_none() || dump_len.is_none() {
                    return Err("--dump-wram takes <start> <len>".into());
                }
            }
            _ if rom.is_none() => rom = Some(resolve_rom_path(&arg)?),
            other => return Err(format!("unknown argument: {}", other)),
        }
    }

    // 環境変数でも指定可能（ヘッドレス実行スクリプト用）
    if let Some(v) = std::env::var("HEADLESS_FRAMES")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        frames = v;
    }

    let rom = rom.ok_or("usage: sfc-emulator <rom> [--frames N] [--seconds S] [--dump-wram START LEN]")?;
    Ok(Options {
        rom,
        frames,
        seconds,
        dump_wram: dump_start.zip(dump_len),
    })
}

fn dump_wram(emu: &Emulator, start: u32, len: u32) {
    let wram = emu.bus.wram();
    let start = start as usize % wram.len();
    let end = (start + len as usize).min(wram.len());
    for (i, chunk) in wram[start..end].chunks(16).enumerate() {
        let offset = start + i * 16;
        let bytes: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
        println!("7E:{:04X}  {}", offset, bytes.join(" "));
    }
}

fn main() {
    env_logger::init();

    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{}", message);
            process::exit(2);
        }
    };

    let mut emu = Emulator::new();
    if let Err(err) = emu.load_rom_file(&options.rom.to_string_lossy()) {
        eprintln!("failed to load ROM: {}", err);
        process::exit(1);
    }

    if let Some(seconds) = options.seconds {
        log::info!("running for {} emulated seconds", seconds);
        emu.step_seconds(seconds);
    } else {
        log::info!("running for {} frames", options.frames);
        for _ in 0..options.frames {
            emu.run_frame();
        }
    }

    log::info!(
        "done: {} master cycles, {} CPU cycles, frame {}",
        emu.total_master_cycles(),
        emu.cpu.total_cycles(),
        emu.bus.ppu_timer.frame
    );

    if let Some((start, len)) = options.dump_wram {
        dump_wram(&emu, start, len);
    }

    if let Err(err) = emu.save_sram() {
        log::warn!("failed to persist SRAM: {}", err);
    }
}
