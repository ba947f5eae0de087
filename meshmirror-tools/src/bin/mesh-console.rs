// mesh-console
//
// Full-screen console for a mesh radio on a serial port: node status,
// known nodes, and the latest sent and received text messages.
//
// Quit: Esc / Ctrl-C

use crossbeam::channel;
use crossterm::event::{self, Event};
use meshmirror::console::{Console, Flow};
use meshmirror::radio::{LinkOptions, SerialLink};
use meshmirror_tools::{
    banner, console_opts, enum_devices, init_logging, key_from_event, ConsoleOpts, Tui,
};
use std::io;
use std::time::Duration;

fn print_help_and_exit(opts: &getopts::Options, program: &str, code: i32) -> ! {
    let brief = format!(
        "Usage: {program} [options] <serial-port>\n\n\
         Mirror a mesh radio node onto the terminal."
    );
    eprintln!("{}", opts.usage(&brief));
    std::process::exit(code)
}

fn list_ports() {
    let devices = enum_devices();
    if devices.is_empty() {
        println!("No serial ports found");
        return;
    }
    for dev in devices {
        match dev.bridge {
            Some(bridge) => println!(" * {} ({bridge}, likely radio)", dev.path),
            None => println!("   {}", dev.path),
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let program = args
        .first()
        .cloned()
        .unwrap_or_else(|| "mesh-console".into());
    let opts = console_opts();
    let cli = match ConsoleOpts::parse(&opts, args.get(1..).unwrap_or_default()) {
        Ok(cli) => cli,
        Err(f) => {
            eprintln!("{f}");
            print_help_and_exit(&opts, &program, 1);
        }
    };
    if cli.help {
        print_help_and_exit(&opts, &program, 0);
    }
    if cli.list {
        list_ports();
        return;
    }
    let Some(port) = cli.port.clone() else {
        print_help_and_exit(&opts, &program, 1);
    };

    let log_gate = match init_logging(&cli.log_level, cli.log_file.as_deref()) {
        Ok(gate) => gate,
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            std::process::exit(1);
        }
    };

    println!("Connecting to radio on {port}...");
    let link_opts = LinkOptions {
        baud: cli.baud,
        handshake_timeout: cli.handshake_timeout,
        ..Default::default()
    };
    let link = match SerialLink::connect(&port, &link_opts) {
        Ok(link) => link,
        Err(e) => {
            eprintln!("Failed to connect: {e}");
            std::process::exit(1);
        }
    };
    for line in banner(&port) {
        println!("{line}");
    }
    tracing::info!("console started on {port}");

    let mut console = Console::new(cli.blink, cli.history);

    let mut tui = match Tui::setup() {
        Ok(tui) => tui,
        Err(e) => {
            Tui::restore();
            eprintln!("Terminal setup failed: {e}");
            std::process::exit(1);
        }
    };
    // Log lines on stderr would land on top of the display.
    log_gate.hold();
    let original_hook = std::panic::take_hook();
    let hook_gate = log_gate.clone();
    std::panic::set_hook(Box::new(move |panic_info| {
        Tui::restore();
        hook_gate.release();
        original_hook(panic_info);
    }));

    // Keyboard handler
    let (key_tx, key_rx) = channel::unbounded::<io::Result<Event>>();
    std::thread::spawn(move || loop {
        let ev = event::read();
        let failed = ev.is_err();
        if key_tx.send(ev).is_err() || failed {
            break;
        }
    });

    let mut text_rx = link.texts();
    let tick = channel::tick(cli.frame_interval());

    'main: loop {
        let mut link_closed = false;
        let redraw = crossbeam::select! {
            recv(key_rx) -> ev => match ev {
                Ok(Ok(Event::Resize(w, h))) => {
                    tui.resize(w, h);
                    true
                }
                Ok(Ok(ev)) => {
                    if let Some(key) = key_from_event(&ev) {
                        if console.on_key(key, &link) == Flow::Quit {
                            break 'main;
                        }
                    }
                    false
                }
                Ok(Err(e)) => {
                    tracing::error!("terminal input failed: {e}");
                    break 'main;
                }
                Err(_) => break 'main,
            },
            recv(text_rx) -> packet => match packet {
                Ok(packet) => console.on_receive(Some(&packet)),
                Err(_) => {
                    link_closed = true;
                    false
                }
            },
            recv(tick) -> _ => true,
        };

        if link_closed {
            tracing::warn!("radio link closed, showing last known state");
            text_rx = channel::never();
        }
        if redraw {
            if let Err(e) = console.redraw(&mut tui, &link) {
                tracing::error!("display failed: {e}");
                break 'main;
            }
        }
    }

    tui.teardown();
    log_gate.release();
    if !link.close(Duration::from_secs(1)) {
        tracing::warn!("radio port did not close in time");
    }
    tracing::info!("console closed");
}
