//! Pairing presentation.
//!
//! The agent decides what to show and hands a [`PairingRequest`] to a
//! [`PairingPresenter`]. [`TerminalPresenter`] renders requests on stderr
//! and reads answers from stdin on a worker thread.

use std::cell::{Cell, RefCell};
use std::io::{BufRead, Write};
use std::rc::Rc;

use deskbridge_core::bluetooth::pairing::{PairingMode, PairingState, PairingTemplate};
use gtk4::glib;
use parking_lot::Once;
use tracing::{debug, warn};

/// One pairing step to present.
#[derive(Debug, Clone)]
pub struct PairingRequest {
    pub device_name: String,
    pub template: PairingTemplate,
    pub state: PairingState,
}

impl PairingRequest {
    pub fn new(device_name: &str, state: PairingState) -> Self {
        Self {
            device_name: device_name.to_string(),
            template: state.mode().template(device_name),
            state,
        }
    }
}

/// The user's answer to a [`PairingRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingAnswer {
    /// Accepted. Entry modes carry the PIN the user settled on.
    Accept(Option<String>),
    Cancel,
}

pub type AnswerFn = Box<dyn FnOnce(PairingAnswer)>;

/// Front end for pairing steps. Display-only modes may never answer; the
/// agent dismisses them when BlueZ is done with the request.
pub trait PairingPresenter {
    fn show(&self, request: PairingRequest, answer: AnswerFn);

    /// Refresh the request on screen, e.g. after keypresses were reported.
    fn update(&self, state: &PairingState);

    /// Close whatever is showing. A pending answer is dropped unanswered.
    fn dismiss(&self);
}

/// Reads stdin lines and delivers them to the main loop. Started once.
static STDIN_READER: Once = Once::new();

struct Pending {
    serial: u64,
    state: PairingState,
    answer: Option<AnswerFn>,
}

/// Presenter that talks to the controlling terminal.
pub struct TerminalPresenter {
    next_serial: Cell<u64>,
    pending: RefCell<Option<Pending>>,
}

impl TerminalPresenter {
    fn new() -> Rc<Self> {
        Rc::new(Self {
            next_serial: Cell::new(1),
            pending: RefCell::new(None),
        })
    }

    pub fn global() -> Rc<Self> {
        thread_local! {
            static INSTANCE: Rc<TerminalPresenter> = TerminalPresenter::new();
        }

        INSTANCE.with(|p| p.clone())
    }

    fn start_reader() {
        STDIN_READER.call_once(|| {
            let spawned = std::thread::Builder::new()
                .name("deskbridge-stdin".into())
                .spawn(|| {
                    let stdin = std::io::stdin();
                    for line in stdin.lock().lines() {
                        match line {
                            Ok(line) => {
                                glib::idle_add_once(move || {
                                    TerminalPresenter::global().handle_line(line.trim());
                                });
                            }
                            Err(e) => {
                                warn!("TerminalPresenter: stdin read failed: {}", e);
                                break;
                            }
                        }
                    }
                    debug!("TerminalPresenter: stdin closed");
                });
            if let Err(e) = spawned {
                warn!("TerminalPresenter: failed to spawn stdin reader: {}", e);
            }
        });
    }

    fn handle_line(&self, line: &str) {
        let Some(mut pending) = self.pending.borrow_mut().take() else {
            return;
        };
        let Some(answer) = pending.answer.take() else {
            // Display-only step; input is not expected.
            self.pending.replace(Some(pending));
            return;
        };

        let reply = parse_answer(pending.state.mode(), pending.state.pin(), line);
        match reply {
            Some(reply) => {
                debug!("TerminalPresenter: answered request {}", pending.serial);
                answer(reply);
            }
            None => {
                write_stderr("PIN is too short, try again:");
                pending.answer = Some(answer);
                self.pending.replace(Some(pending));
            }
        }
    }
}

/// Map a typed line to an answer, or `None` if the line cannot be accepted.
/// Entry modes take the line as the PIN, falling back to the suggested one
/// when it is empty. Questions accept "y"/"yes".
fn parse_answer(mode: PairingMode, suggested: Option<&str>, line: &str) -> Option<PairingAnswer> {
    if mode.has_entry() {
        let state = PairingState::new(mode, suggested.map(str::to_string));
        let pin = if line.is_empty() {
            suggested.unwrap_or_default()
        } else {
            line
        };
        if pin.eq_ignore_ascii_case("n") || pin.eq_ignore_ascii_case("no") {
            return Some(PairingAnswer::Cancel);
        }
        return state
            .done_sensitive(pin)
            .then(|| PairingAnswer::Accept(Some(pin.to_string())));
    }

    let yes = matches!(line.to_ascii_lowercase().as_str(), "y" | "yes");
    Some(if yes {
        PairingAnswer::Accept(None)
    } else {
        PairingAnswer::Cancel
    })
}

fn write_stderr(text: &str) {
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", text);
}

/// Text block for a request.
fn render(request: &PairingRequest) -> String {
    let template = &request.template;
    let mut out = format!("== {} ==\n{}", template.title, template.help);
    if template.pin_visible {
        out.push_str(&format!("\n\n    {}\n", request.state.display_pin()));
    }
    if template.entry_visible {
        let suggested = request.state.pin().unwrap_or_default();
        out.push_str(&format!(
            "\nPIN [{}] ({} to accept, n to {}):",
            suggested,
            template.ok_label,
            template.cancel_label.to_lowercase()
        ));
    } else if template.done_visible {
        out.push_str(&format!("\n{}? [y/N]", template.ok_label));
    }
    out
}

impl PairingPresenter for TerminalPresenter {
    fn show(&self, request: PairingRequest, answer: AnswerFn) {
        Self::start_reader();

        let serial = self.next_serial.get();
        self.next_serial.set(serial + 1);

        write_stderr(&render(&request));

        // Display modes have nothing to accept.
        let answer = request.template.done_visible.then_some(answer);
        self.pending.replace(Some(Pending {
            serial,
            state: request.state,
            answer,
        }));
    }

    fn update(&self, state: &PairingState) {
        let mut pending = self.pending.borrow_mut();
        if let Some(pending) = pending.as_mut() {
            pending.state = state.clone();
            write_stderr(&format!("    {}", state.display_pin()));
        }
    }

    fn dismiss(&self) {
        if let Some(pending) = self.pending.borrow_mut().take() {
            debug!("TerminalPresenter: dismissed request {}", pending.serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer_entry_modes() {
        let mode = PairingMode::PinConfirmation;
        assert_eq!(
            parse_answer(mode, Some("123456"), ""),
            Some(PairingAnswer::Accept(Some("123456".to_string())))
        );
        assert_eq!(
            parse_answer(mode, Some("123456"), "4321"),
            Some(PairingAnswer::Accept(Some("4321".to_string())))
        );
        assert_eq!(parse_answer(mode, Some("123456"), "12"), None);
        assert_eq!(parse_answer(mode, Some("123456"), "n"), Some(PairingAnswer::Cancel));
    }

    #[test]
    fn test_parse_answer_questions() {
        assert_eq!(
            parse_answer(PairingMode::YesNo, None, "Y"),
            Some(PairingAnswer::Accept(None))
        );
        assert_eq!(
            parse_answer(PairingMode::ConfirmAuth, None, ""),
            Some(PairingAnswer::Cancel)
        );
    }

    #[test]
    fn test_render_display_mode() {
        let state = PairingState::new(PairingMode::PinDisplayKeyboard, Some("482913".into()));
        let text = render(&PairingRequest::new("Keys", state));
        assert!(text.starts_with("== Pairing 'Keys' =="));
        assert!(text.contains("482913"));
        assert!(!text.contains("[y/N]"));
    }

    #[test]
    fn test_render_question() {
        let state = PairingState::new(PairingMode::YesNo, None);
        let text = render(&PairingRequest::new("Phone", state));
        assert!(text.contains("wants to pair"));
        assert!(text.ends_with("Allow? [y/N]"));
    }
}
