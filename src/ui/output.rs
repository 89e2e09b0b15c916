use crate::pagination::{Cursor, CursorResult};
use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;

pub fn heading(text: &str) {
    println!("{} {}", Icons::STORE, text.style(theme().title));
}

pub fn saved(text: &str) {
    println!("{} {}", Icons::SAVED, text.style(theme().ok));
}

pub fn deleted(count: usize) {
    println!("{} {}", Icons::DELETED, format!("Deleted {} entities", count).style(theme().ok));
}

pub fn failure(text: &str) {
    eprintln!("{} {}", Icons::FAILED, text.style(theme().failure));
}

pub fn caution(text: &str) {
    eprintln!("{} {}", Icons::CAUTION, text.style(theme().caution));
}

/// A uid with a label, e.g. after generating one.
pub fn uid_line(label: &str, uid: &str) {
    println!("{} {:>6}: {}", Icons::KEY, label.style(theme().label), uid.style(theme().uid));
}

/// Previous, next and last cursors of a page; `-` where there is none.
pub fn cursors<T>(page: &CursorResult<T>) {
    let rows = [
        (Icons::PREVIOUS, "previous", &page.previous_cursor),
        (Icons::NEXT, "next", &page.next_cursor),
        (Icons::LAST, "last", &page.last_cursor),
    ];
    for (icon, label, cursor) in rows {
        let value = cursor.as_ref().map(Cursor::urlsafe).unwrap_or_else(|| "-".to_string());
        println!("{} {:>8}: {}", icon, label.style(theme().label), value.style(theme().cursor));
    }
    if page.more {
        println!("  {}", "more results available".style(theme().label));
    }
}

pub fn link(header: &str) {
    println!("{} {}: {}", Icons::LINK, "Link".style(theme().label), header);
}
