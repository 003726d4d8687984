use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser};
use log::{error, info};

use rv32cache::devices::pump_input;
use rv32cache::{BackingKind, Config, DtbConfig, FaultPolicy, MachineExit, System, TimingMode};

const MB: u32 = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(author, version, about = "RV32IMA emulator over cached backing storage")]
struct Args {
    /// Guest image (raw, gzip or zstd), loaded at 0x80000000
    image: PathBuf,

    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Guest RAM in MiB
    #[arg(long)]
    ram_mb: Option<u32>,

    /// Number of backing storage units
    #[arg(long)]
    units: Option<usize>,

    /// Capacity of each backing unit in MiB
    #[arg(long)]
    unit_mb: Option<u32>,

    /// Back each unit with a file in this directory
    #[arg(long)]
    file_backing: Option<PathBuf>,

    /// Derive time from the instruction count instead of the host clock
    #[arg(long, action = ArgAction::SetTrue)]
    fixed_time: bool,

    /// Divide elapsed microseconds by this before feeding the timer
    #[arg(long)]
    time_divisor: Option<u32>,

    /// Stop on the first guest exception instead of trapping into the guest
    #[arg(long, action = ArgAction::SetTrue)]
    fail_fast: bool,

    /// Instructions per batch
    #[arg(long)]
    batch: Option<u32>,

    /// Spin instead of sleeping while the guest waits for an interrupt
    #[arg(long, action = ArgAction::SetTrue)]
    no_sleep: bool,

    /// Save a compressed state dump here when the session stops or faults
    #[arg(long)]
    dump: Option<PathBuf>,

    /// Use this device tree blob instead of the generated one
    #[arg(long)]
    dtb: Option<PathBuf>,

    /// Byte offset of the RAM-size cell in the --dtb blob
    #[arg(long, value_parser = parse_offset)]
    dtb_ram_offset: Option<usize>,
}

fn mib(flag: &str, mb: u32) -> Result<u32> {
    mb.checked_mul(MB)
        .ok_or_else(|| anyhow!("--{} {} does not fit in a 32-bit byte count", flag, mb))
}

fn parse_offset(s: &str) -> std::result::Result<usize, String> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("invalid offset '{}': {}", s, e))
}

impl Args {
    fn to_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_json_file(path)
                .with_context(|| format!("failed to read config {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(mb) = self.ram_mb {
            config.ram_size = mib("ram-mb", mb)?;
        }
        if let Some(units) = self.units {
            config.backing.unit_count = units;
        }
        if let Some(mb) = self.unit_mb {
            config.backing.unit_capacity = mib("unit-mb", mb)?;
        }
        if let Some(dir) = &self.file_backing {
            config.backing.kind = BackingKind::File { dir: dir.clone() };
        }
        if self.fixed_time {
            config.timing = TimingMode::Fixed;
        }
        if let Some(divisor) = self.time_divisor {
            config.time_divisor = divisor;
        }
        if self.fail_fast {
            config.fault_policy = FaultPolicy::FailFast;
        }
        if let Some(batch) = self.batch {
            config.instructions_per_batch = batch;
        }
        if self.no_sleep {
            config.idle_on_wait = false;
        }
        if let Some(path) = &self.dtb {
            let mut dtb = DtbConfig {
                path: path.clone(),
                ram_size_offset: rv32cache::config::DEFAULT_DTB_RAM_OFFSET,
            };
            if let Some(offset) = self.dtb_ram_offset {
                dtb.ram_size_offset = offset;
            }
            config.dtb = Some(dtb);
        } else if let (Some(dtb), Some(offset)) = (config.dtb.as_mut(), self.dtb_ram_offset) {
            dtb.ram_size_offset = offset;
        }
        Ok(config)
    }
}

#[cfg(unix)]
mod terminal {
    use std::mem;
    use std::os::unix::io::RawFd;

    /// Restores the saved terminal mode when dropped
    pub struct RawMode {
        fd: RawFd,
        orig: libc::termios,
    }

    impl RawMode {
        /// Disable echo, line buffering and signal keys. `None` if `fd` is
        /// not a terminal.
        pub fn enable(fd: RawFd) -> Option<Self> {
            unsafe {
                if libc::isatty(fd) == 0 {
                    return None;
                }
                let mut orig: libc::termios = mem::zeroed();
                if libc::tcgetattr(fd, &mut orig) != 0 {
                    return None;
                }
                let mut raw = orig;
                raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN);
                raw.c_iflag &= !(libc::ICRNL | libc::IXON);
                raw.c_cc[libc::VMIN] = 1;
                raw.c_cc[libc::VTIME] = 0;
                if libc::tcsetattr(fd, libc::TCSANOW, &raw) != 0 {
                    return None;
                }
                Some(RawMode { fd, orig })
            }
        }
    }

    impl Drop for RawMode {
        fn drop(&mut self) {
            unsafe {
                libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
            }
        }
    }
}

fn main() -> ExitCode {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(MachineExit::PowerOff) | Ok(MachineExit::Reboot) => ExitCode::SUCCESS,
        Ok(MachineExit::Fault) => ExitCode::from(2),
        Ok(MachineExit::Unknown(_)) => ExitCode::from(3),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<MachineExit> {
    let config = args.to_config()?;
    let mut system = System::new(config).context("failed to build the machine")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let sender = system.keyboard_sender();
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("keyboard".into())
            .spawn(move || pump_input(io::stdin().lock(), &sender, &stop))
            .context("failed to spawn the keyboard thread")?;
    }

    #[cfg(unix)]
    let _raw = terminal::RawMode::enable(libc::STDIN_FILENO);

    info!("press Ctrl-A x to stop");
    let stdout = io::stdout();
    let exit = loop {
        system
            .boot_file(&args.image)
            .with_context(|| format!("failed to boot {}", args.image.display()))?;

        let exit = system.run(&stop, &mut stdout.lock())?;
        if exit != MachineExit::Reboot {
            break exit;
        }
        info!("guest requested reboot");
    };

    if let Some(path) = &args.dump {
        if stop.load(Ordering::Relaxed) || exit == MachineExit::Fault {
            let bytes = system.dump().to_bytes()?;
            fs::write(path, bytes)
                .with_context(|| format!("failed to write dump {}", path.display()))?;
            info!("state dump written to {}", path.display());
        }
    }

    system.flush().context("failed to flush the cache")?;
    stdout.lock().flush()?;
    Ok(exit)
}
