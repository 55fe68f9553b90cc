//! Disguised keypad engine.
//!
//! The engine is an ordinary four-function calculator. Every key also lands in a
//! short rolling buffer that is scanned for secret sequences after the arithmetic
//! has been applied; the scan never changes what the display shows.
//!
//! The engine is pure. It reports what happened as [`Signal`]s and leaves alerts,
//! contacts and navigation to the orchestrator in [`crate::app`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::event::{ContactId, Pin};
use crate::model::AlertTrigger;
use crate::{LONG_PRESS_ALERT_THRESHOLD, SEQUENCE_BUFFER_CAPACITY};

/// Shown instead of a number when a calculation cannot produce one.
pub const ERROR_DISPLAY: &str = "Error";

const DIGIT_LABELS: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// `1 1 1 1 =` leaves disguise mode.
const EXIT_SEQUENCE: [Key; 5] = [
    Key::Digit(1),
    Key::Digit(1),
    Key::Digit(1),
    Key::Digit(1),
    Key::Equals,
];

/// `= 1 1 1 1` raises an alert addressed to the first emergency contact.
const CALL_CONTACT_SEQUENCE: [Key; 5] = [
    Key::Equals,
    Key::Digit(1),
    Key::Digit(1),
    Key::Digit(1),
    Key::Digit(1),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl Operator {
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "×",
            Self::Divide => "÷",
        }
    }

    pub fn apply(self, lhs: f64, rhs: f64) -> Result<f64, ArithmeticError> {
        let result = match self {
            Self::Add => lhs + rhs,
            Self::Subtract => lhs - rhs,
            Self::Multiply => lhs * rhs,
            Self::Divide => {
                if rhs == 0.0 {
                    return Err(ArithmeticError::DivideByZero);
                }
                lhs / rhs
            }
        };
        if result.is_finite() {
            Ok(result)
        } else {
            Err(ArithmeticError::NonFinite)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ArithmeticError {
    #[error("cannot divide by zero")]
    DivideByZero,
    #[error("result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("unknown keypad label {0:?}")]
    UnknownLabel(String),
}

/// One keypad button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Key {
    Digit(u8),
    Decimal,
    Operator(Operator),
    Equals,
    Clear,
    Negate,
    Percent,
    /// Looks like a trig function; opens contact capture.
    Sin,
}

impl Key {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Digit(d) => DIGIT_LABELS.get(usize::from(d)).copied().unwrap_or("?"),
            Self::Decimal => ".",
            Self::Operator(op) => op.symbol(),
            Self::Equals => "=",
            Self::Clear => "C",
            Self::Negate => "±",
            Self::Percent => "%",
            Self::Sin => "sin",
        }
    }

    /// Keys wired for press-and-hold on the keypad.
    #[must_use]
    pub const fn is_long_press_eligible(self) -> bool {
        matches!(self, Self::Digit(_) | Self::Operator(_) | Self::Clear)
    }
}

impl FromStr for Key {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s {
            "." => Self::Decimal,
            "+" => Self::Operator(Operator::Add),
            "-" => Self::Operator(Operator::Subtract),
            "×" | "*" | "x" => Self::Operator(Operator::Multiply),
            "÷" | "/" => Self::Operator(Operator::Divide),
            "=" => Self::Equals,
            "C" => Self::Clear,
            "±" => Self::Negate,
            "%" => Self::Percent,
            "sin" => Self::Sin,
            other => match other.as_bytes() {
                [b @ b'0'..=b'9'] => Self::Digit(b - b'0'),
                _ => return Err(KeyParseError::UnknownLabel(other.to_owned())),
            },
        };
        Ok(key)
    }
}

impl TryFrom<String> for Key {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.label().to_owned()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Renders a result the way the display shows it.
#[must_use]
pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        // Also folds -0 into 0.
        "0".to_owned()
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingOperation {
    operand: f64,
    operator: Operator,
}

/// Arithmetic state. Memory and operation are stored together, so one is never
/// set without the other.
#[derive(Debug, Clone, PartialEq)]
pub struct CalculatorState {
    display: String,
    pending: Option<PendingOperation>,
    is_new_input: bool,
}

impl Default for CalculatorState {
    fn default() -> Self {
        Self {
            display: "0".to_owned(),
            pending: None,
            is_new_input: true,
        }
    }
}

impl CalculatorState {
    pub fn display(&self) -> &str {
        &self.display
    }

    pub fn memory(&self) -> Option<f64> {
        self.pending.map(|p| p.operand)
    }

    pub fn operation(&self) -> Option<Operator> {
        self.pending.map(|p| p.operator)
    }

    pub fn is_new_input(&self) -> bool {
        self.is_new_input
    }

    pub fn is_error(&self) -> bool {
        self.display == ERROR_DISPLAY
    }

    fn current_value(&self) -> f64 {
        self.display.parse().unwrap_or(0.0)
    }

    /// The displayed operand, or the error state when it overflows `f64`.
    fn finite_value(&mut self) -> Result<f64, ArithmeticError> {
        let value = self.current_value();
        if value.is_finite() {
            Ok(value)
        } else {
            self.set_error();
            Err(ArithmeticError::NonFinite)
        }
    }

    fn enter_digit(&mut self, digit: u8) {
        let label = Key::Digit(digit).label();
        if self.is_new_input || self.display == "0" {
            self.display = label.to_owned();
            self.is_new_input = false;
        } else {
            self.display.push_str(label);
        }
    }

    fn enter_decimal(&mut self) {
        if self.is_new_input {
            self.display = "0.".to_owned();
            self.is_new_input = false;
        } else if !self.display.contains('.') {
            self.display.push('.');
        }
    }

    fn choose_operator(&mut self, operator: Operator) -> Result<(), ArithmeticError> {
        if self.is_error() {
            return Ok(());
        }
        match self.pending {
            // Operator straight after operator: only the operator changes.
            Some(pending) if self.is_new_input => {
                self.pending = Some(PendingOperation {
                    operator,
                    ..pending
                });
                return Ok(());
            }
            Some(pending) => {
                let value = self.evaluate(pending)?;
                self.display = format_number(value);
            }
            None => {}
        }
        self.pending = Some(PendingOperation {
            operand: self.finite_value()?,
            operator,
        });
        self.is_new_input = true;
        Ok(())
    }

    fn equals(&mut self) -> Result<(), ArithmeticError> {
        let Some(pending) = self.pending else {
            return Ok(());
        };
        let value = self.evaluate(pending)?;
        self.display = format_number(value);
        self.pending = None;
        self.is_new_input = true;
        Ok(())
    }

    fn evaluate(&mut self, pending: PendingOperation) -> Result<f64, ArithmeticError> {
        pending
            .operator
            .apply(pending.operand, self.current_value())
            .inspect_err(|_| self.set_error())
    }

    fn clear(&mut self) {
        self.display = "0".to_owned();
        self.is_new_input = true;
    }

    fn clear_memory(&mut self) {
        self.pending = None;
    }

    fn negate(&mut self) {
        if self.is_error() || self.current_value() == 0.0 {
            return;
        }
        match self.display.strip_prefix('-') {
            Some(positive) => self.display = positive.to_owned(),
            None => self.display.insert(0, '-'),
        }
    }

    fn percent(&mut self) -> Result<(), ArithmeticError> {
        if self.is_error() {
            return Ok(());
        }
        self.display = format_number(self.finite_value()? / 100.0);
        self.is_new_input = true;
        Ok(())
    }

    fn set_error(&mut self) {
        self.display = ERROR_DISPLAY.to_owned();
        self.pending = None;
        self.is_new_input = true;
    }
}

/// The last few keys pressed, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceBuffer {
    keys: VecDeque<Key>,
}

impl SequenceBuffer {
    pub fn push(&mut self, key: Key) {
        self.keys.push_back(key);
        while self.keys.len() > SEQUENCE_BUFFER_CAPACITY {
            self.keys.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.keys.iter()
    }

    /// True when the most recent keys are exactly `pattern`.
    pub fn ends_with(&self, pattern: &[Key]) -> bool {
        pattern.len() <= self.keys.len()
            && self
                .keys
                .iter()
                .skip(self.keys.len() - pattern.len())
                .eq(pattern.iter())
    }

    pub fn ends_with_pin(&self, pin: &Pin) -> bool {
        let len = pin.len();
        len > 0
            && len <= self.keys.len()
            && self
                .keys
                .iter()
                .skip(self.keys.len() - len)
                .copied()
                .eq(pin.digits().map(Key::Digit))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PressId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HeldKey {
    press: PressId,
    key: Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldStarted {
    pub press: PressId,
    /// The press this one displaced, whose timer must be cancelled.
    pub replaced: Option<PressId>,
}

/// Single-slot press-and-hold tracking. A new hold replaces the pending one.
#[derive(Debug, Clone, Default)]
pub struct LongPressTracker {
    pending: Option<HeldKey>,
    next_press: u64,
    count: u32,
}

impl LongPressTracker {
    pub fn hold(&mut self, key: Key) -> Option<HoldStarted> {
        if !key.is_long_press_eligible() {
            return None;
        }
        self.next_press += 1;
        let press = PressId(self.next_press);
        let replaced = self.pending.replace(HeldKey { press, key }).map(|h| h.press);
        Some(HoldStarted { press, replaced })
    }

    pub fn release(&mut self) -> Option<PressId> {
        self.pending.take().map(|h| h.press)
    }

    /// Consumes the pending hold if `press` is still the current one.
    fn take_elapsed(&mut self, press: PressId) -> Option<Key> {
        match self.pending {
            Some(held) if held.press == press => {
                self.pending = None;
                Some(held.key)
            }
            _ => None,
        }
    }

    /// Counts one completed hold. Returns true, and starts over, once the count
    /// passes the alert threshold.
    fn record_hold(&mut self) -> bool {
        self.count += 1;
        if self.count > LONG_PRESS_ALERT_THRESHOLD {
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub fn pending(&self) -> Option<PressId> {
        self.pending.map(|h| h.press)
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// What the detector matches against, snapshotted from settings and contacts.
#[derive(Debug, Clone, Default)]
pub struct TriggerTable {
    pub alert_pin: Option<Pin>,
    pub contact_pins: Vec<(ContactId, Pin)>,
    pub first_contact: Option<ContactId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    ArithmeticFailed(ArithmeticError),
    SilentAlert {
        contact: Option<ContactId>,
        trigger: AlertTrigger,
    },
    NoContactsConfigured,
    ExitDisguise,
    MemoryCleared,
    ContactCaptureStarted,
    ContactCaptured {
        phone: String,
    },
    ContactCaptureCancelled,
}

#[derive(Debug, Clone, Default)]
pub struct CalculatorEngine {
    state: CalculatorState,
    buffer: SequenceBuffer,
    long_press: LongPressTracker,
    /// Digits typed since `sin` while capturing a phone number.
    capture: Option<String>,
}

impl CalculatorEngine {
    pub fn state(&self) -> &CalculatorState {
        &self.state
    }

    pub fn buffer(&self) -> &SequenceBuffer {
        &self.buffer
    }

    pub fn long_press_count(&self) -> u32 {
        self.long_press.count()
    }

    pub fn pending_press(&self) -> Option<PressId> {
        self.long_press.pending()
    }

    pub fn is_capturing_contact(&self) -> bool {
        self.capture.is_some()
    }

    /// Applies one key press.
    pub fn press(&mut self, key: Key, triggers: &TriggerTable) -> Vec<Signal> {
        self.buffer.push(key);

        let mut signals = Vec::new();
        if self.capture.is_some() {
            self.apply_capture(key, &mut signals);
        } else {
            self.apply_arithmetic(key, &mut signals);
        }

        if let Some(signal) = self.detect(triggers) {
            self.buffer.clear();
            signals.push(signal);
        }
        signals
    }

    pub fn hold(&mut self, key: Key) -> Option<HoldStarted> {
        self.long_press.hold(key)
    }

    pub fn release(&mut self) -> Option<PressId> {
        self.long_press.release()
    }

    pub fn long_press_elapsed(&mut self, press: PressId) -> Vec<Signal> {
        let Some(key) = self.long_press.take_elapsed(press) else {
            return Vec::new();
        };
        if key == Key::Clear {
            self.state.clear_memory();
            return vec![Signal::MemoryCleared];
        }
        if self.long_press.record_hold() {
            vec![Signal::SilentAlert {
                contact: None,
                trigger: AlertTrigger::LongPress,
            }]
        } else {
            Vec::new()
        }
    }

    fn apply_arithmetic(&mut self, key: Key, signals: &mut Vec<Signal>) {
        let outcome = match key {
            Key::Digit(d) => {
                self.state.enter_digit(d);
                Ok(())
            }
            Key::Decimal => {
                self.state.enter_decimal();
                Ok(())
            }
            Key::Operator(op) => self.state.choose_operator(op),
            Key::Equals => self.state.equals(),
            Key::Clear => {
                self.state.clear();
                Ok(())
            }
            Key::Negate => {
                self.state.negate();
                Ok(())
            }
            Key::Percent => self.state.percent(),
            Key::Sin => {
                self.capture = Some(String::new());
                self.state.clear();
                signals.push(Signal::ContactCaptureStarted);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            signals.push(Signal::ArithmeticFailed(e));
        }
    }

    fn apply_capture(&mut self, key: Key, signals: &mut Vec<Signal>) {
        let Some(phone) = self.capture.as_mut() else {
            return;
        };
        match key {
            Key::Digit(_) => {
                phone.push_str(key.label());
                self.state.display.clone_from(phone);
                self.state.is_new_input = false;
            }
            Key::Equals => {
                let phone = std::mem::take(phone);
                self.capture = None;
                self.state.clear();
                if !phone.is_empty() {
                    signals.push(Signal::ContactCaptured { phone });
                }
            }
            Key::Clear => {
                self.capture = None;
                self.state.clear();
                signals.push(Signal::ContactCaptureCancelled);
            }
            Key::Decimal | Key::Operator(_) | Key::Negate | Key::Percent | Key::Sin => {}
        }
    }

    fn detect(&self, triggers: &TriggerTable) -> Option<Signal> {
        if triggers
            .alert_pin
            .as_ref()
            .is_some_and(|pin| self.buffer.ends_with_pin(pin))
        {
            return Some(Signal::SilentAlert {
                contact: None,
                trigger: AlertTrigger::Pin,
            });
        }

        if let Some((id, _)) = triggers
            .contact_pins
            .iter()
            .find(|(_, pin)| self.buffer.ends_with_pin(pin))
        {
            return Some(Signal::SilentAlert {
                contact: Some(id.clone()),
                trigger: AlertTrigger::ContactPin,
            });
        }

        if self.buffer.ends_with(&EXIT_SEQUENCE) {
            return Some(Signal::ExitDisguise);
        }

        if self.buffer.ends_with(&CALL_CONTACT_SEQUENCE) {
            return Some(match &triggers.first_contact {
                Some(id) => Signal::SilentAlert {
                    contact: Some(id.clone()),
                    trigger: AlertTrigger::EmergencyContactSequence,
                },
                None => Signal::NoContactsConfigured,
            });
        }

        None
    }
}
