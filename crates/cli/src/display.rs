//! Table rendering for conflicts and stable locations.

use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use reposcope_core::models::{BookmarkEntry, ConflictSet, PlaceholderState};

use crate::style;

pub fn conflicts_table(set: &ConflictSet) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Path", "Status", "Tool"]);

    for file in &set.files {
        table.add_row(vec![
            Cell::new(&file.path),
            Cell::new(style::conflict_status(file.status, file.pending_resolve)),
            Cell::new(file.tool.as_deref().unwrap_or("—")),
        ]);
    }
    table
}

pub fn stables_table(entries: &[BookmarkEntry]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Name", "Commit", "Date", "Notes"]);

    for entry in entries {
        let row = match entry {
            BookmarkEntry::Named { name } => vec![name.clone(), "—".into(), "—".into(), String::new()],
            BookmarkEntry::Detailed {
                info,
                newer_than_latest,
                removable,
            } => {
                let mut notes = Vec::new();
                if *newer_than_latest {
                    notes.push(style::warn("newer than latest pulled commit, pull to fetch it"));
                }
                if *removable {
                    notes.push(style::dim("manual"));
                }
                if let Some(info) = &info.info {
                    notes.push(info.clone());
                }
                let hash: String = info.hash.chars().take(12).collect();
                vec![
                    info.name.clone(),
                    hash,
                    info.date
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M")
                        .to_string(),
                    notes.join("\n"),
                ]
            }
            BookmarkEntry::Placeholder { name, state } => {
                let note = match state {
                    PlaceholderState::Loading => style::dim("loading…"),
                    PlaceholderState::Failed(message) => style::error(message),
                };
                vec![name.clone(), "—".into(), "—".into(), note]
            }
        };
        table.add_row(row);
    }
    table
}
