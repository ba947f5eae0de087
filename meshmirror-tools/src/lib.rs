use crossterm::event::{Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::style::{Color, Print, ResetColor, SetBackgroundColor, SetForegroundColor};
use crossterm::{cursor, terminal, ExecutableCommand, QueueableCommand};
use getopts::Options;
use meshmirror::console::{Key, Surface, Tint};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn console_opts() -> Options {
    let mut opts = Options::new();
    opts.optflag("h", "help", "Show help");
    opts.optflag("", "list", "List serial ports and exit");
    opts.optopt("", "baud", "Serial baud rate (default 115200)", "rate");
    opts.optopt(
        "",
        "timeout",
        "Seconds to wait for the radio configuration (default 60)",
        "sec",
    );
    opts.optopt("", "fps", "UI refresh rate (default 10)", "n");
    opts.optopt(
        "",
        "blink-ms",
        "Indicator blink period in ms, 0 toggles every frame (default 0)",
        "ms",
    );
    opts.optopt("", "history", "Messages kept per log (default 256)", "n");
    opts.optopt(
        "",
        "log-level",
        "Log filter, e.g. info or meshmirror=debug (default warn)",
        "level",
    );
    opts.optopt("", "log-file", "Write logs to this file instead of stderr", "path");
    opts
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleOpts {
    pub port: Option<String>,
    pub help: bool,
    pub list: bool,
    pub baud: u32,
    pub handshake_timeout: Duration,
    pub fps: u64,
    pub blink: Duration,
    pub history: usize,
    pub log_level: String,
    pub log_file: Option<String>,
}

fn parse_or<T: std::str::FromStr>(m: &getopts::Matches, name: &str, default: T) -> T {
    m.opt_str(name)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl ConsoleOpts {
    /// Parses the arguments following the program name.
    pub fn parse(opts: &Options, args: &[String]) -> Result<ConsoleOpts, getopts::Fail> {
        let m = opts.parse(args)?;
        Ok(ConsoleOpts {
            port: m.free.first().cloned(),
            help: m.opt_present("help"),
            list: m.opt_present("list"),
            baud: parse_or(&m, "baud", meshmirror::radio::port::serial::DEFAULT_RATE),
            handshake_timeout: Duration::from_secs(parse_or(&m, "timeout", 60)),
            fps: parse_or(&m, "fps", 10u64).max(1),
            blink: Duration::from_millis(parse_or(&m, "blink-ms", 0)),
            history: parse_or(&m, "history", meshmirror::console::history::DEFAULT_CAPACITY),
            log_level: m.opt_str("log-level").unwrap_or_else(|| "warn".to_string()),
            log_file: m.opt_str("log-file"),
        })
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1))
    }
}

/// Largest amount of log output kept back while the display is up.
const MAX_BACKLOG: usize = 64 * 1024;

#[derive(Default)]
struct GateState {
    held: bool,
    backlog: Vec<u8>,
    dropped: usize,
}

/// Holds stderr log output back while the full-screen display owns the
/// terminal, and writes it out once the display is gone.
#[derive(Clone, Default)]
pub struct LogGate {
    state: Arc<Mutex<GateState>>,
}

impl LogGate {
    /// Starts buffering log output.
    pub fn hold(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.held = true;
        }
    }

    /// Stops buffering and writes the backlog to stderr.
    pub fn release(&self) {
        let _ = self.release_into(&mut io::stderr());
    }

    fn release_into<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let Ok(mut state) = self.state.lock() else {
            return Ok(());
        };
        state.held = false;
        let backlog = std::mem::take(&mut state.backlog);
        let dropped = std::mem::take(&mut state.dropped);
        out.write_all(&backlog)?;
        if dropped > 0 {
            writeln!(out, "({dropped} bytes of log output dropped)")?;
        }
        out.flush()
    }

    fn writer(&self) -> GateWriter {
        GateWriter {
            state: self.state.clone(),
        }
    }
}

struct GateWriter {
    state: Arc<Mutex<GateState>>,
}

impl Write for GateWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.held {
            return io::stderr().write(buf);
        }
        if state.backlog.len() + buf.len() <= MAX_BACKLOG {
            state.backlog.extend_from_slice(buf);
        } else {
            state.dropped += buf.len();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Installs the global `tracing` subscriber. Logs go to `file` when given,
/// to stderr otherwise. Stderr output can be held back with the returned
/// gate.
pub fn init_logging(level: &str, file: Option<&str>) -> io::Result<LogGate> {
    use tracing_subscriber::EnvFilter;

    let gate = LogGate::default();
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_thread_names(true);
    let res = match file {
        Some(path) => {
            let f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder.with_writer(Mutex::new(f)).try_init()
        }
        None => {
            let make_writer = {
                let gate = gate.clone();
                move || gate.writer()
            };
            builder.with_writer(make_writer).try_init()
        }
    };
    res.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    Ok(gate)
}

/// Lines printed before the display takes over the terminal.
pub fn banner(port: &str) -> Vec<String> {
    vec![
        format!("mesh-console {}", env!("CARGO_PKG_VERSION")),
        format!("Radio on {port} connected."),
        format!(
            "Type '{}' and press Enter to change the channel.",
            meshmirror::console::session::CHANNEL_COMMAND
        ),
        "Press Esc or Ctrl-C to quit.".to_string(),
    ]
}

/// A serial port found on the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialDevice {
    pub path: String,
    /// USB bridge chip, when it is one commonly found on mesh radios.
    pub bridge: Option<&'static str>,
}

fn usb_bridge(vid: u16) -> Option<&'static str> {
    match vid {
        0x10c4 => Some("CP210x"),
        0x1a86 => Some("CH34x"),
        0x303a => Some("ESP32"),
        0x239a => Some("nRF52"),
        0x0403 => Some("FTDI"),
        _ => None,
    }
}

pub fn enum_devices() -> Vec<SerialDevice> {
    let mut devices = Vec::new();
    if let Ok(ports) = serialport::available_ports() {
        for p in ports {
            let bridge = match &p.port_type {
                serialport::SerialPortType::UsbPort(info) => usb_bridge(info.vid),
                _ => None,
            };
            #[cfg(target_os = "macos")]
            if p.port_name.starts_with("/dev/tty.") {
                continue;
            }
            devices.push(SerialDevice {
                path: p.port_name,
                bridge,
            });
        }
    }
    devices
}

/// Maps a terminal event to a console key. Releases and unrelated keys map
/// to `None`.
pub fn key_from_event(ev: &Event) -> Option<Key> {
    let Event::Key(k) = ev else {
        return None;
    };
    if k.kind == KeyEventKind::Release {
        return None;
    }
    match k.code {
        KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => Some(Key::Interrupt),
        KeyCode::Char(_) if k.modifiers.contains(KeyModifiers::CONTROL) => None,
        KeyCode::Char(c) => Some(Key::Char(c)),
        KeyCode::Enter => Some(Key::Enter),
        KeyCode::Backspace => Some(Key::Backspace),
        KeyCode::Esc => Some(Key::Escape),
        _ => None,
    }
}

fn color(tint: Tint) -> Color {
    match tint {
        Tint::Neon => Color::Cyan,
        Tint::Amber => Color::Rgb {
            r: 255,
            g: 165,
            b: 0,
        },
    }
}

/// Full-screen terminal surface.
pub struct Tui {
    stdout: io::Stdout,
    size: (u16, u16),
}

impl Tui {
    pub fn setup() -> io::Result<Self> {
        let mut stdout = io::stdout();
        terminal::enable_raw_mode()?;
        stdout.execute(terminal::EnterAlternateScreen)?;
        stdout.execute(cursor::Hide)?;
        let size = terminal::size()?;
        Ok(Self { stdout, size })
    }

    /// Restores the terminal. Safe to call more than once, and from a
    /// panic hook.
    pub fn teardown(&mut self) {
        let _ = self.stdout.execute(ResetColor);
        let _ = self.stdout.execute(cursor::Show);
        let _ = self.stdout.execute(terminal::LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
        let _ = self.stdout.flush();
    }

    /// Restores a terminal without a `Tui` at hand.
    pub fn restore() {
        let mut t = Tui {
            stdout: io::stdout(),
            size: (0, 0),
        };
        t.teardown();
    }

    pub fn resize(&mut self, w: u16, h: u16) {
        self.size = (w, h);
    }

    /// Longest prefix of `text` that fits in `cells`.
    fn clip<'a>(&self, text: &'a str, cells: usize) -> &'a str {
        let mut used = 0;
        let mut buf = [0u8; 4];
        for (i, c) in text.char_indices() {
            used += self.measure(c.encode_utf8(&mut buf));
            if used > cells {
                return &text[..i];
            }
        }
        text
    }
}

impl Surface for Tui {
    fn size(&self) -> (u16, u16) {
        self.size
    }

    fn clear(&mut self) -> io::Result<()> {
        self.stdout.queue(SetBackgroundColor(Color::Black))?;
        self.stdout.queue(terminal::Clear(terminal::ClearType::All))?;
        Ok(())
    }

    fn text(&mut self, x: u16, y: u16, text: &str, tint: Tint) -> io::Result<()> {
        let (w, h) = self.size;
        if x >= w || y >= h {
            return Ok(());
        }
        let visible = self.clip(text, (w - x) as usize);
        self.stdout.queue(cursor::MoveTo(x, y))?;
        self.stdout.queue(SetForegroundColor(color(tint)))?;
        self.stdout.queue(Print(visible))?;
        Ok(())
    }

    fn plot(&mut self, x: u16, y: u16, glyph: char, tint: Tint) -> io::Result<()> {
        let (w, h) = self.size;
        if x >= w || y >= h {
            return Ok(());
        }
        self.stdout.queue(cursor::MoveTo(x, y))?;
        self.stdout.queue(SetForegroundColor(color(tint)))?;
        self.stdout.queue(Print(glyph))?;
        Ok(())
    }

    fn present(&mut self) -> io::Result<()> {
        self.stdout.queue(ResetColor)?;
        self.stdout.flush()
    }
}
