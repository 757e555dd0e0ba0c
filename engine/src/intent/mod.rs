//! Intent detection for the fast path
//!
//! A handful of questions ("jam berapa sekarang?", "what time is it") have a
//! deterministic answer and should never wait on a model. Detection is plain
//! case-insensitive phrase matching; the first matching action wins.

use crate::actions::ActionKind;

const TIME_PHRASES: &[&str] = &[
    "jam berapa",
    "pukul berapa",
    "waktu sekarang",
    "hari apa",
    "tanggal berapa",
    "what time",
    "current time",
    "what day",
    "today's date",
    "what's the date",
];

const STATUS_PHRASES: &[&str] = &[
    "status sistem",
    "cek sistem",
    "kondisi sistem",
    "suhu cpu",
    "penggunaan memori",
    "system status",
    "cpu temperature",
    "memory usage",
    "uptime",
];

const LIST_PHRASES: &[&str] = &[
    "daftar file",
    "lihat file",
    "list file",
    "isi folder",
    "show files",
];

const INTENTS: &[(ActionKind, &[&str])] = &[
    (ActionKind::GetTime, TIME_PHRASES),
    (ActionKind::GetSystemStatus, STATUS_PHRASES),
    (ActionKind::ListFiles, LIST_PHRASES),
];

/// Maps a free-text message to an action, if it matches a known phrase.
///
/// Pure: the same text always yields the same answer.
pub fn detect(text: &str) -> Option<ActionKind> {
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }

    INTENTS
        .iter()
        .find(|(_, phrases)| phrases.iter().any(|p| normalized.contains(p)))
        .map(|(kind, _)| *kind)
}
