#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use optiboot_loader::linux::{LinuxReset, SysfsReset};
use optiboot_loader::{Checksum, Error, Image, Options, Programmer, Progress, RtsReset, Task};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Just test communications with bootloader
    #[structopt(short, long, conflicts_with_all = &["verify", "read"])]
    test: bool,

    /// Verify current contents against file
    #[structopt(short, long, conflicts_with = "read")]
    verify: bool,

    /// Read and display flash contents
    #[structopt(short, long)]
    read: bool,

    /// Reset a USB attached board via RTS (default is GPIO)
    #[structopt(short, long)]
    usb: bool,

    /// Serial port to connect to (defaults to /dev/ttyACM0 with --usb, otherwise /dev/ttyAMA0)
    #[structopt(short, long)]
    port: Option<String>,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// GPIO wired to the target reset line
    #[structopt(long, default_value = "4")]
    reset_pin: u64,

    /// Number of bytes to read in read mode
    #[structopt(long, default_value = "32768")]
    read_size: usize,

    /// Save data read in read mode to a binary file
    #[structopt(long, parse(from_os_str))]
    output: Option<PathBuf>,

    /// Reject hex records with invalid checksums
    #[structopt(long)]
    strict_checksum: bool,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Intel hex file to verify or program
    #[structopt(parse(from_os_str))]
    file: Option<PathBuf>,
}

impl Args {
    fn load(&self, action: &str) -> anyhow::Result<Image> {
        let path = match &self.file {
            Some(p) => p,
            None => bail!("Please supply one filename for {}", action),
        };

        let checksum = match self.strict_checksum {
            true => Checksum::Verify,
            false => Checksum::Ignore,
        };

        let image = Image::load(path, checksum)
            .with_context(|| format!("Error loading {}", path.display()))?;

        info!("Loaded {} at 0x{:04x} from {}", bytefmt::format(image.len() as u64), image.base, path.display());

        Ok(image)
    }

    fn task(&self) -> anyhow::Result<Task> {
        let t = if self.test {
            Task::Test
        } else if self.read {
            Task::Read{ size: self.read_size }
        } else if self.verify {
            Task::Verify(self.load("verification")?)
        } else {
            Task::Program(self.load("programming")?)
        };

        Ok(t)
    }
}

fn progress_bar(task: &Task) -> ProgressBar {
    let len = match task {
        Task::Verify(i) | Task::Program(i) => i.len(),
        _ => return ProgressBar::hidden(),
    };

    let bar = ProgressBar::new(len as u64);
    bar.set_style(ProgressStyle::default_bar()
        .template("{msg:>9} [{bar:40}] {bytes}/{total_bytes}")
        .progress_chars("=> "));

    bar
}

fn run(o: Args) -> anyhow::Result<()> {
    let reset = match o.usb {
        true => LinuxReset::Rts(RtsReset::default()),
        false => LinuxReset::Gpio(SysfsReset::new(o.reset_pin)),
    };

    let port = match &o.port {
        Some(p) => p.clone(),
        None if o.usb => "/dev/ttyACM0".to_string(),
        None => "/dev/ttyAMA0".to_string(),
    };

    info!("Connecting to serial port {}", port);

    let mut p = Programmer::linux(&port, o.baud, reset, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", port))?;

    // Sync before loading, the target is only reset once
    match p.init() {
        Ok(()) => (),
        Err(Error::NoBootloader{ .. }) => bail!("No bootloader found on {}", port),
        Err(e) => return Err(e.into()),
    }

    let task = o.task()?;

    let bar = progress_bar(&task);
    let mut stage = "";

    let res = p.execute_with(&task, |s| {
        let (name, n) = match s {
            Progress::Read(n) => ("reading", n),
            Progress::Program(n) => ("writing", n),
            Progress::Verify(n) => ("verifying", n),
        };

        if name != stage {
            stage = name;
            bar.reset();
            bar.set_message(name);
        }

        bar.set_position(n as u64);
    });

    bar.finish_and_clear();

    let data = res?;

    if let Task::Test = task {
        info!("Bootloader on {}: communications OK", port);
    }

    if let (Task::Read{ .. }, Some(path)) = (&task, &o.output) {
        std::fs::write(path, &data)
            .with_context(|| format!("Error writing {}", path.display()))?;

        info!("Saved {} to {}", bytefmt::format(data.len() as u64), path.display());
    }

    Ok(())
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
