//! Frame rendering
//!
//! A frame is painted onto any `Surface`: a grid of character cells with a
//! known size. All positions are derived from percentages of the surface
//! size, so the layout follows the terminal as it is resized.

use super::history::MessageLog;
use super::session::Session;
use super::wrap::wrap_text;
use crate::radio::{DeviceLink, NodeSnapshot, Peer};

use std::io;
use unicode_width::UnicodeWidthStr;

/// Palette of the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tint {
    /// Node info, peers, the indicator and the prompt.
    Neon,
    /// Messages.
    Amber,
}

/// Drawing target for one frame at a time.
pub trait Surface {
    /// Width and height, in cells.
    fn size(&self) -> (u16, u16);
    fn clear(&mut self) -> io::Result<()>;
    /// Draws `text` starting at column `x`, row `y`. Text past the right
    /// edge is dropped.
    fn text(&mut self, x: u16, y: u16, text: &str, tint: Tint) -> io::Result<()>;
    /// Draws a single cell.
    fn plot(&mut self, x: u16, y: u16, glyph: char, tint: Tint) -> io::Result<()>;
    /// Makes everything drawn since `clear` visible.
    fn present(&mut self) -> io::Result<()>;
    /// Number of cells `text` occupies.
    fn measure(&self, text: &str) -> usize {
        UnicodeWidthStr::width(text)
    }
}

/// Everything a frame shows besides what comes from the radio.
pub struct View<'a> {
    pub session: &'a Session,
    pub received: &'a MessageLog,
    pub sent: &'a MessageLog,
}

const RING_GLYPH: char = 'o';
const ARROW_GLYPH: char = '/';

fn pct(total: u16, percent: u32) -> u16 {
    (total as u32 * percent / 100) as u16
}

fn gap(total: u16, percent: u32) -> u16 {
    pct(total, percent).max(1)
}

/// Paints frames, remembering the last node snapshot and peer table that
/// could be read so a failed read never blanks the display.
#[derive(Default)]
pub struct Renderer {
    last_node: Option<NodeSnapshot>,
    last_peers: Vec<Peer>,
    node_error: Option<String>,
    peers_error: Option<String>,
}

/// Logs a derivation error only when it differs from the previous one.
fn note_error(slot: &mut Option<String>, what: &str, err: Option<String>) {
    if err != *slot {
        match &err {
            Some(e) => tracing::warn!("{what} unavailable: {e}"),
            None => tracing::info!("{what} available again"),
        }
        *slot = err;
    }
}

impl Renderer {
    pub fn new() -> Renderer {
        Renderer::default()
    }

    pub fn last_node(&self) -> Option<&NodeSnapshot> {
        self.last_node.as_ref()
    }

    fn refresh<L: DeviceLink + ?Sized>(&mut self, link: &L) {
        match link.own_node() {
            Ok(node) => {
                self.last_node = Some(node);
                note_error(&mut self.node_error, "node info", None);
            }
            Err(e) => note_error(&mut self.node_error, "node info", Some(e.to_string())),
        }
        match link.peers() {
            Ok(peers) => {
                self.last_peers = peers;
                note_error(&mut self.peers_error, "node table", None);
            }
            Err(e) => note_error(&mut self.peers_error, "node table", Some(e.to_string())),
        }
    }

    fn node_lines(&self, channel: u8) -> Vec<String> {
        let mut lines = Vec::with_capacity(5);
        match &self.last_node {
            Some(node) => {
                lines.push(format!("Node: {} ({})", node.display_name, node.id));
                lines.push(match node.position {
                    Some((lat, lon)) => format!("Location: Lat: {lat:.5}, Long: {lon:.5}"),
                    None => "Location: Unknown".to_string(),
                });
                lines.push(match node.snr {
                    Some(snr) => format!("Signal: {snr:.2} dB"),
                    None => "Signal: Unknown".to_string(),
                });
                lines.push(format!("Role: {}", node.role));
            }
            None => {
                lines.push("Node: Unknown".to_string());
                lines.push("Location: Unknown".to_string());
                lines.push("Signal: Unknown".to_string());
                lines.push("Role: Unknown".to_string());
            }
        }
        lines.push(format!("Channel: {}", channel));
        lines
    }

    /// Paints one complete frame and presents it.
    pub fn paint<S, L>(&mut self, surface: &mut S, view: &View, link: &L) -> io::Result<()>
    where
        S: Surface + ?Sized,
        L: DeviceLink + ?Sized,
    {
        self.refresh(link);

        let (w, h) = surface.size();
        surface.clear()?;

        if view.session.blink.visible() {
            draw_indicator(surface, w, h)?;
        }

        let x = pct(w, 5);
        let input_row = h.saturating_sub(pct(h, 10));
        let mut body = Body {
            x,
            y: pct(h, 5),
            limit: input_row,
        };

        for line in self.node_lines(view.session.channel()) {
            body.line(surface, &line, Tint::Neon)?;
        }

        let wrap_width = w.saturating_sub(pct(w, 6)) as usize;
        for (log, prefix) in [(view.received, "Recv: "), (view.sent, "Sent: ")] {
            if let Some(entry) = log.last() {
                body.skip(gap(h, 2));
                let budget = wrap_width.saturating_sub(surface.measure(prefix)).max(1);
                let message = entry.to_string();
                for line in wrap_text(&message, budget, |s| surface.measure(s)) {
                    body.line(surface, &format!("{prefix}{line}"), Tint::Amber)?;
                }
            }
        }

        body.skip(gap(h, 5));
        body.line(
            surface,
            &format!("Connected Nodes: {}", self.last_peers.len()),
            Tint::Neon,
        )?;
        for peer in &self.last_peers {
            body.line(
                surface,
                &format!("Node {}: {}", peer.id, peer.display_name),
                Tint::Neon,
            )?;
        }

        let prompt = view.session.input_line();
        let prompt_x = (w as usize).saturating_sub(surface.measure(&prompt)) / 2;
        surface.text(prompt_x as u16, input_row, &prompt, Tint::Neon)?;

        surface.present()
    }
}

/// Cursor over the body rows, above the prompt.
struct Body {
    x: u16,
    y: u16,
    limit: u16,
}

impl Body {
    fn skip(&mut self, rows: u16) {
        self.y = self.y.saturating_add(rows);
    }

    fn line<S: Surface + ?Sized>(&mut self, surface: &mut S, text: &str, tint: Tint) -> io::Result<()> {
        if self.y < self.limit {
            surface.text(self.x, self.y, text, tint)?;
        }
        self.skip(1);
        Ok(())
    }
}

fn plot_clipped<S: Surface + ?Sized>(
    surface: &mut S,
    w: u16,
    h: u16,
    x: f64,
    y: f64,
    glyph: char,
) -> io::Result<()> {
    let (x, y) = (x.round(), y.round());
    if x < 0.0 || y < 0.0 || x >= w as f64 || y >= h as f64 {
        return Ok(());
    }
    surface.plot(x as u16, y as u16, glyph, Tint::Neon)
}

/// Ring with a pointer in the upper right corner. Cells are about twice as
/// tall as they are wide, so horizontal distances are doubled.
fn draw_indicator<S: Surface + ?Sized>(surface: &mut S, w: u16, h: u16) -> io::Result<()> {
    let radius = pct(h, 15).max(1) as f64;
    let arrow = pct(h, 20).max(1) as f64;
    let cx = w as f64 - 2.0 * radius - pct(w, 3) as f64;
    let cy = radius + pct(h, 4) as f64;

    let steps = (radius as usize * 16).max(32);
    for i in 0..steps {
        let theta = i as f64 / steps as f64 * std::f64::consts::TAU;
        let x = cx + 2.0 * radius * theta.cos();
        let y = cy + radius * theta.sin();
        plot_clipped(surface, w, h, x, y, RING_GLYPH)?;
    }

    let angle = std::f64::consts::FRAC_PI_4;
    let steps = (arrow as usize * 2).max(2);
    for i in 1..=steps {
        let t = i as f64 / steps as f64 * arrow;
        let x = cx + 2.0 * t * angle.cos();
        let y = cy - t * angle.sin();
        plot_clipped(surface, w, h, x, y, ARROW_GLYPH)?;
    }
    Ok(())
}
