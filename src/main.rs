mod cli;

use std::convert::TryInto;
use std::fs::OpenOptions;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use structopt::StructOpt;

use lmt_logger_core::beacon::{self, KEY_LEN};
use lmt_logger_core::core::LoggerCore;
use lmt_logger_core::flash::emulated::EmulatedFlash;
use lmt_logger_core::flash::{Flash, PAGE_SIZE};
use lmt_logger_core::receiver::{ReceiverOutcome, ScanSchedConfig};
use lmt_logger_core::recording::sink::BufferSink;
use lmt_logger_core::recording::{NullFrameSource, RecordingEngine};
use lmt_logger_core::storage::StorageEngine;

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        anyhow::bail!("hex string must have an even number of digits");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(Into::into))
        .collect()
}

fn now_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Device serial for the virtual slot 0, derived from the image path
/// since there is no MCU unique id to read in an emulated backend.
fn device_serial_slot0(seed: &[u8]) -> [u8; PAGE_SIZE] {
    let digest = Sha256::digest(seed);
    let hex = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    let mut buf = [0u8; PAGE_SIZE];
    let bytes = hex.as_bytes();
    let len = bytes.len().min(PAGE_SIZE);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn open_image(opts: &cli::Opts) -> Result<EmulatedFlash<std::fs::File>> {
    let capacity_bytes = (opts.capacity_pages as u64 * PAGE_SIZE as u64).next_power_of_two();

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&opts.image_path)
        .with_context(|| format!("opening flash image {:?}", opts.image_path))?;
    file.set_len(capacity_bytes)?;

    EmulatedFlash::new(file, capacity_bytes).context("initializing emulated flash backend")
}

fn main() -> Result<()> {
    pretty_env_logger::init();
    let opts = cli::Opts::from_args();
    run(opts)
}

fn run(opts: cli::Opts) -> Result<()> {
    let flash = open_image(&opts)?;
    let storage = StorageEngine::new(flash)?;
    let mut engine = RecordingEngine::boot(storage)?;

    match opts.command {
        cli::Command::Erase => {
            let geometry = engine.storage().geometry();
            for page in 0..geometry.imu_pages + geometry.sync_pages {
                if page % lmt_logger_core::flash::PAGES_PER_SECTOR as u32 == 0 {
                    engine
                        .storage()
                        .flash_mut()
                        .erase_sector(page * PAGE_SIZE as u32)?;
                }
            }
            log::info!("erased IMU and sync regions");
        }

        cli::Command::EraseAll => {
            engine.storage().flash_mut().erase_chip()?;
            log::info!("erased entire chip");
        }

        cli::Command::Record { pages } => {
            let mut source = NullFrameSource;
            engine.start_session(now_ms(), pages, &mut source)?;
            println!("recording started at page {}", engine.current_page());
        }

        cli::Command::Dump { pages } => {
            engine.start_playback(pages)?;
            let mut out = BufferSink::default();
            engine.stream_playback_ascii(&mut out)?;
            print!("{}", out.as_str());
            if engine.playback_warning_count() > 0 {
                eprintln!("warning: {} page(s) failed CRC", engine.playback_warning_count());
            }
        }

        cli::Command::Sdump => {
            let mut out = BufferSink::default();
            engine.stream_sync_ascii(&mut out)?;
            print!("{}", out.as_str());
        }

        cli::Command::Store { slot, text } => {
            let mut payload = [0xFFu8; PAGE_SIZE];
            let bytes = text.as_bytes();
            let len = bytes.len().min(PAGE_SIZE);
            payload[..len].copy_from_slice(&bytes[..len]);
            engine.storage().write_slot(slot, &payload)?;
            println!("wrote {} byte(s) to slot {}", len, slot);
        }

        cli::Command::Read { slot } => {
            let raw = if slot == 0 {
                device_serial_slot0(opts.image_path.to_string_lossy().as_bytes())
            } else {
                engine.storage().read_slot(slot)?
            };
            for chunk in raw.chunks(32) {
                let hex = chunk.iter().map(|b| format!("{:02x}", b)).collect::<String>();
                println!("{}", hex);
            }
        }

        cli::Command::Frame => {
            let last_known = Default::default();
            let mut source = NullFrameSource;
            let result =
                RecordingEngine::<EmulatedFlash<std::fs::File>>::service_live_frame(
                    &mut source,
                    now_ms(),
                    now_ms(),
                    last_known,
                );
            match result {
                Some(r) => println!(
                    "{} {} {} {} {} {} {} {} {} {} timed_out={}",
                    0,
                    r.frame.q0,
                    r.frame.q1,
                    r.frame.q2,
                    r.frame.q3,
                    r.frame.ax,
                    r.frame.ay,
                    r.frame.az,
                    r.frame.mx,
                    r.frame.my,
                    r.timed_out
                ),
                None => println!("no frame available yet"),
            }
        }

        cli::Command::Aframe => {
            let last_known = Default::default();
            let mut source = NullFrameSource;
            if let Some(r) = RecordingEngine::<EmulatedFlash<std::fs::File>>::service_live_frame(
                &mut source,
                now_ms(),
                now_ms(),
                last_known,
            ) {
                let hex = r
                    .frame
                    .to_bytes()
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>();
                println!("{}", hex);
            } else {
                println!("no frame available yet");
            }
        }

        cli::Command::Status => {
            let geometry = engine.storage().geometry();
            println!("mode: {:?}", engine.mode());
            println!("current_page: {}", engine.current_page());
            println!("frame_counter: {}", engine.frame_counter());
            println!(
                "geometry: imu_pages={} sync_pages={} storage_base={}",
                geometry.imu_pages, geometry.sync_pages, geometry.storage_base
            );
        }

        cli::Command::Beacon { payload, rtc_ms, key } => {
            let raw = decode_hex(&payload)?;
            let key_bytes = key.map(|k| decode_hex(&k)).transpose()?;
            let key_arr: Option<[u8; KEY_LEN]> = match key_bytes {
                Some(bytes) => Some(
                    bytes
                        .as_slice()
                        .try_into()
                        .context("key must be exactly 16 bytes")?,
                ),
                None => None,
            };

            let parsed = beacon::parse(&raw, key_arr.as_ref()).context("parsing beacon payload")?;

            let scan_config = ScanSchedConfig {
                period_ms: 60_000,
                scan_duration_ms: 5_000,
                initial_phase_offset_ms: 0,
                prelock_back_to_back: true,
            };
            let mut core = LoggerCore::new(engine, scan_config);
            match core.ingest_beacon(&parsed, rtc_ms) {
                ReceiverOutcome::Accepted(report) => {
                    println!(
                        "accepted: post_local_ms={} freq_ppm={:.3} scheduler_locked={}",
                        report.post_local_ms,
                        report.freq_ppm,
                        core.scheduler.is_locked()
                    );
                }
                ReceiverOutcome::Rejected(reason) => {
                    println!("rejected: {}", reason);
                }
            }
        }
    }

    Ok(())
}
