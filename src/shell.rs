//! Interactive operator shell
//!
//! One engine call per command. Write progress arrives over the event bus and
//! is printed between prompts.

use nix::sys::termios::{
    tcgetattr, tcsetattr, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};
use std::io::{IsTerminal, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use crate::config::PathsConfig;
use crate::error::{AppError, Result};
use crate::events::LabEvent;
use crate::flash::{list_block_devices, WriteStatus};
use crate::hid::passthrough::{decode_input, LiveInput};
use crate::lifecycle::{describe_write, GadgetEngine, GadgetState, LabStatus};
use crate::msd::{list_available_images, size_display};

const PROMPT: &str = "labtool> ";

const HELP: &str = "\
Commands:
  iso [path]                 select an image (show the selection without a path)
  images                     list images in the image directory
  devices                    list writable block devices
  write <device>             write the selected image to a device
  cancel                     cancel the running write
  emulate [start|stop]       expose the selected image as a USB drive
  keyboard [start|stop]      act as a USB keyboard
  keyboard live              send terminal keystrokes to the host, Ctrl-] returns
  type <text>                type text on the host
  key <name>                 press a key or combination (enter, f2, ctrl+alt+delete)
  status [--json]            show current state
  reset                      stop everything and clear the gadget
  help                       show this help
  exit | quit                leave (Ctrl-D also works)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Start,
    Stop,
}

/// Parsed shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Iso(Option<String>),
    Images,
    Devices,
    Write(String),
    Cancel,
    Emulate(Option<Toggle>),
    Keyboard(Option<Toggle>),
    KeyboardLive,
    Type(String),
    Key(String),
    Status { json: bool },
    Reset,
    Help,
    Exit,
}

/// Parse one input line; `Ok(None)` for a blank line
pub fn parse_command(line: &str) -> std::result::Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    let toggle = |what: &str| match rest {
        "" => Ok(None),
        "start" | "on" => Ok(Some(Toggle::Start)),
        "stop" | "off" => Ok(Some(Toggle::Stop)),
        other => Err(format!("usage: {} [start|stop] (got '{}')", what, other)),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "iso" => Command::Iso(arg),
        "images" | "ls" => Command::Images,
        "devices" => Command::Devices,
        "write" => Command::Write(arg.ok_or("usage: write <device>")?),
        "cancel" => Command::Cancel,
        "emulate" => Command::Emulate(toggle("emulate")?),
        "keyboard" | "kbd" if rest == "live" => Command::KeyboardLive,
        "keyboard" | "kbd" => Command::Keyboard(toggle("keyboard")?),
        // Text is typed as entered, including inner whitespace
        "type" => Command::Type(arg.ok_or("usage: type <text>")?),
        "key" => Command::Key(arg.ok_or("usage: key <name>")?),
        "status" => match rest {
            "" => Command::Status { json: false },
            "--json" | "json" => Command::Status { json: true },
            other => return Err(format!("usage: status [--json] (got '{}')", other)),
        },
        "reset" => Command::Reset,
        "help" | "?" => Command::Help,
        "exit" | "quit" => Command::Exit,
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };
    Ok(Some(command))
}

/// Result of executing a command
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue(String),
    Exit,
}

pub struct Shell {
    engine: Arc<GadgetEngine>,
    paths: PathsConfig,
}

impl Shell {
    pub fn new(engine: Arc<GadgetEngine>, paths: PathsConfig) -> Self {
        Self { engine, paths }
    }

    /// Read commands from stdin until `exit`, EOF or Ctrl-C
    pub async fn run(&self) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut events = self.engine.events().subscribe();
        let mut interrupt = listen_interrupt()?;

        println!("labtool ready, type 'help' for commands");
        prompt();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        println!();
                        break;
                    };
                    match parse_command(&line) {
                        Ok(None) => {}
                        Ok(Some(command)) => {
                            // Live mode reads through the line buffer so typeahead is kept
                            let result = match command {
                                Command::KeyboardLive => {
                                    self.keyboard_live(lines.get_mut()).await.map(Flow::Continue)
                                }
                                command => self.execute(command).await,
                            };
                            match result {
                                Ok(Flow::Exit) => break,
                                Ok(Flow::Continue(output)) if !output.is_empty() => println!("{}", output),
                                Ok(Flow::Continue(_)) => {}
                                Err(e) => println!("Error [{}]: {}", e.code(), e),
                            }
                        }
                        Err(usage) => println!("{}", usage),
                    }
                    prompt();
                }
                received = interrupt.recv() => {
                    if received.is_none() {
                        warn!("Interrupt listener closed");
                        break;
                    }
                    match self.engine.cancel_write() {
                        Ok(job) => {
                            println!("\nCancelling write to {}", job.device.display());
                            prompt();
                        }
                        Err(_) => {
                            println!();
                            break;
                        }
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => match render_event(&event) {
                        Some(line) => {
                            println!("\n{}", line);
                            prompt();
                        }
                        None => trace!("Event {} not shown", event.event_name()),
                    },
                    Err(RecvError::Lagged(n)) => debug!("Shell missed {} events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }

    /// Execute one command and return what to print
    pub async fn execute(&self, command: Command) -> Result<Flow> {
        let output = match command {
            Command::Iso(None) => match self.engine.selected_image() {
                Some(image) => format!(
                    "Selected: {} ({}) at {}",
                    image.name,
                    image.size_display(),
                    image.path.display()
                ),
                None => "No image selected. Usage: iso <path>".to_string(),
            },
            Command::Iso(Some(path)) => {
                let image = self.engine.select_image(&self.resolve_image(&path)).await?;
                format!("Selected {} ({})", image.name, image.size_display())
            }
            Command::Images => {
                let images = list_available_images(&self.paths.image_dir)?;
                if images.is_empty() {
                    format!("No images in {}", self.paths.image_dir.display())
                } else {
                    images
                        .iter()
                        .map(|i| format!("  {:<40} {:>12}", i.name, size_display(i.size)))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Command::Devices => {
                let devices = list_block_devices(&self.paths.device_dir)?;
                if devices.is_empty() {
                    "No block devices found".to_string()
                } else {
                    devices
                        .iter()
                        .map(|d| {
                            let size = d.size.map(size_display).unwrap_or_else(|| "?".into());
                            format!("  {:<20} {:>12}", d.path.display(), size)
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Command::Write(device) => {
                let job = self.engine.write(&self.resolve_device(&device)).await?;
                format!(
                    "Writing {} to {} (job {}), Ctrl-C or 'cancel' to stop",
                    job.source.name,
                    job.device.display(),
                    job.id
                )
            }
            Command::Cancel => {
                let job = self.engine.cancel_write()?;
                format!("Cancelling write to {}", job.device.display())
            }
            Command::Emulate(toggle) => {
                let start = toggle.map_or(!self.engine.status().emulation_active, |t| t == Toggle::Start);
                if start {
                    self.engine.emulate_start().await?;
                    "Mass storage emulation started".to_string()
                } else {
                    self.engine.emulate_stop().await?;
                    "Mass storage emulation stopped".to_string()
                }
            }
            Command::Keyboard(toggle) => {
                let start = toggle.map_or(!self.engine.status().keyboard_active, |t| t == Toggle::Start);
                if start {
                    self.engine.keyboard_start().await?;
                    "Keyboard started".to_string()
                } else {
                    self.engine.keyboard_stop().await?;
                    "Keyboard stopped".to_string()
                }
            }
            Command::KeyboardLive => self.keyboard_live(&mut tokio::io::stdin()).await?,
            Command::Type(text) => {
                let sent = self.engine.type_text(&text).await?;
                let skipped = text.chars().count() - sent;
                if skipped > 0 {
                    format!("Typed {} characters ({} skipped)", sent, skipped)
                } else {
                    format!("Typed {} characters", sent)
                }
            }
            Command::Key(name) => {
                self.engine.press_key(&name)?;
                String::new()
            }
            Command::Status { json } => {
                let status = self.engine.status();
                if json {
                    serde_json::to_string_pretty(&status)
                        .map_err(|e| AppError::Internal(e.to_string()))?
                } else {
                    render_status(&status)
                }
            }
            Command::Reset => match self.engine.reset().await? {
                GadgetState::Error { reason } => format!("Reset incomplete: {}", reason),
                _ => "Gadget reset".to_string(),
            },
            Command::Help => HELP.to_string(),
            Command::Exit => return Ok(Flow::Exit),
        };
        Ok(Flow::Continue(output))
    }

    /// Forward keystrokes from `input` until Ctrl-] or EOF
    ///
    /// Starts the keyboard if needed and leaves it running on return.
    async fn keyboard_live<R: AsyncRead + Unpin>(&self, input: &mut R) -> Result<String> {
        if !self.engine.status().keyboard_active {
            self.engine.keyboard_start().await?;
        }
        println!("Live keyboard, Ctrl-] returns to the shell");

        let sent = {
            let _raw = RawMode::enter()?;
            forward_keys(&self.engine, input).await?
        };
        Ok(format!("Left live keyboard ({} keys sent)", sent))
    }

    /// Paths that do not exist as given are looked up in the image directory
    fn resolve_image(&self, arg: &str) -> PathBuf {
        let path = PathBuf::from(arg);
        if path.is_absolute() || path.exists() {
            return path;
        }
        self.paths.image_dir.join(path)
    }

    /// Bare names such as `sdb` are taken relative to the device directory
    fn resolve_device(&self, arg: &str) -> PathBuf {
        let path = Path::new(arg);
        if path.components().count() == 1 && !path.exists() {
            return self.paths.device_dir.join(path);
        }
        path.to_path_buf()
    }
}

/// SIGINT listener, created once so no interrupt between polls is lost
fn listen_interrupt() -> Result<Signal> {
    Ok(signal(SignalKind::interrupt())?)
}

/// Tap every decoded key; returns the number of keys sent
async fn forward_keys<R: AsyncRead + Unpin>(engine: &GadgetEngine, input: &mut R) -> Result<usize> {
    let mut buf = [0u8; 64];
    let mut sent = 0;

    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            return Ok(sent);
        }
        for item in decode_input(&buf[..n]) {
            let LiveInput::Key(code, modifiers) = item else {
                return Ok(sent);
            };
            match engine.tap_key(code, modifiers) {
                Ok(()) => sent += 1,
                Err(e @ AppError::NotActive(_)) => return Err(e),
                Err(e) => warn!("Key 0x{:02x} not sent: {}", code, e),
            }
        }
    }
}

/// Stdin without echo, line buffering or signal keys; restored on drop
struct RawMode {
    saved: Termios,
}

impl RawMode {
    /// `None` when stdin is not a terminal
    fn enter() -> Result<Option<Self>> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }

        let saved = tcgetattr(&stdin).map_err(std::io::Error::from)?;
        let mut raw = saved.clone();
        raw.local_flags
            .remove(LocalFlags::ECHO | LocalFlags::ICANON | LocalFlags::ISIG);
        raw.input_flags.remove(InputFlags::ICRNL | InputFlags::IXON);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(&stdin, SetArg::TCSANOW, &raw).map_err(std::io::Error::from)?;

        debug!("Terminal in raw mode");
        Ok(Some(Self { saved }))
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        match tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &self.saved) {
            Ok(()) => debug!("Terminal restored"),
            Err(e) => warn!("Failed to restore terminal: {}", e),
        }
    }
}

fn prompt() {
    print!("{}", PROMPT);
    let _ = std::io::stdout().flush();
}

fn render_status(status: &LabStatus) -> String {
    let mut lines = Vec::new();

    lines.push(match &status.selected_image {
        Some(image) => format!("Image:    {} ({})", image.name, image.size_display()),
        None => "Image:    none".to_string(),
    });
    lines.push(match &status.gadget_state {
        GadgetState::MassStorageActive { image } => format!("Gadget:   mass storage ({})", image.name),
        GadgetState::Error { reason } => format!("Gadget:   error ({})", reason),
        other => format!("Gadget:   {}", other.as_str()),
    });
    lines.push(format!(
        "Engine:   {}",
        serde_json::to_value(status.engine_state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    ));
    if let Some(progress) = &status.write_progress {
        lines.push(format!(
            "Write:    {} -> {}: {} ({:.1}%)",
            progress.source,
            progress.device.display(),
            describe_write(&progress.status, progress.bytes_written),
            progress.percentage()
        ));
        if progress.status == WriteStatus::Running {
            lines.push(format!(
                "          {}/s",
                size_display(progress.bytes_per_sec() as u64)
            ));
        }
    }
    lines.join("\n")
}

fn render_event(event: &LabEvent) -> Option<String> {
    match event {
        LabEvent::WriteProgress {
            bytes_written,
            total_bytes,
            ..
        } => {
            let percent = if *total_bytes == 0 {
                100.0
            } else {
                *bytes_written as f64 / *total_bytes as f64 * 100.0
            };
            Some(format!(
                "write: {:5.1}% ({} of {})",
                percent,
                size_display(*bytes_written),
                size_display(*total_bytes)
            ))
        }
        LabEvent::WriteFinished {
            status,
            bytes_written,
            error,
            ..
        } => Some(match error {
            Some(error) => format!("write {}: {} ({} written)", status, error, size_display(*bytes_written)),
            None => format!("write {}: {} written", status, size_display(*bytes_written)),
        }),
        LabEvent::GadgetStateChanged {
            state, reason: Some(reason), ..
        } if state == "error" => Some(format!("gadget error: {}", reason)),
        _ => None,
    }
}
