//! Human-readable renderings of tickets
//!
//! Everything here is pure formatting; the action label is passed in because
//! role tickets are named after their tracked role.

use crate::platform::TicketCard;

use super::{ActionType, Ticket};

/// Text used when a ticket has no reason yet
pub const NO_REASON: &str = "No reason.";

fn mention(user_id: u64) -> String {
    format!("<@{user_id}>")
}

/// Full card mirrored to the notification channel and shown in prompts
#[must_use]
pub fn ticket_card(ticket: &Ticket, label: &str) -> TicketCard {
    let field_name = if ticket.action == ActionType::Note {
        "Note"
    } else {
        "Reason"
    };
    TicketCard {
        header: format!("Ticket #{}", ticket.number),
        title: format!("{label} {}", ticket.subject_id),
        description: format!("**Acting moderator:** {}", mention(ticket.moderator_id)),
        fields: vec![(
            field_name.to_string(),
            ticket.reason.clone().unwrap_or_else(|| NO_REASON.to_string()),
        )],
        footer: Some("Created at".to_string()),
        timestamp: Some(ticket.created_at),
    }
}

/// Placeholder posted before a ticket is stored, to reserve the message id
#[must_use]
pub fn placeholder_card(number: u64) -> TicketCard {
    TicketCard {
        header: format!("Ticket #{number}"),
        ..Default::default()
    }
}

/// One-line summary, e.g. `(#4) MUTED 1234`
#[must_use]
pub fn ticket_summary(ticket: &Ticket, label: &str) -> String {
    format!("(#{}) {label} {}", ticket.number, ticket.subject_id)
}

/// Link to the notification message mirroring a ticket
///
/// `channel_id` is only used for tickets that did not record their channel.
#[must_use]
pub fn message_link(ticket: &Ticket, channel_id: u64) -> Option<String> {
    let channel_id = ticket.notification_channel_id.unwrap_or(channel_id);
    ticket.notification_message_id.map(|message_id| {
        format!(
            "https://discord.com/channels/{}/{channel_id}/{message_id}",
            ticket.guild_id
        )
    })
}

/// Entry for a user's log: time, ticket number, action, moderator, reason
#[must_use]
pub fn user_log_line(ticket: &Ticket, label: &str, channel_id: u64) -> String {
    let number = match message_link(ticket, channel_id) {
        Some(link) => format!("[#{}]({link})", ticket.number),
        None => format!("#{}", ticket.number),
    };
    format!(
        "{} {number}: {label} by {}\n```{}```",
        ticket.created_at.format("%Y-%m-%d %H:%M:%S"),
        mention(ticket.moderator_id),
        ticket.reason.as_deref().unwrap_or(NO_REASON)
    )
}

/// Describe the transactions recorded in a ticket's history, oldest first
#[must_use]
pub fn history_lines(history: &[Ticket]) -> Vec<String> {
    let Some(first) = history.first() else {
        return Vec::new();
    };
    let mut lines = vec![format!(
        "{}: Ticket was created by {} with reason ```{}```",
        first.created_at.format("%Y-%m-%d %H:%M:%S"),
        mention(first.moderator_id),
        first.reason.as_deref().unwrap_or(NO_REASON)
    )];

    for pair in history.windows(2) {
        let (old, new) = (&pair[0], &pair[1]);
        let at = new.modified_at.format("%Y-%m-%d %H:%M:%S");
        if old.reason != new.reason {
            lines.push(format!(
                "{at}: Ticket reason was changed by {} to ```{}```",
                mention(new.modified_by_id),
                new.reason.as_deref().unwrap_or(NO_REASON)
            ));
        }
        if old.moderator_id != new.moderator_id {
            lines.push(format!(
                "{at}: Ticket moderator was changed to {} by {}.",
                mention(new.moderator_id),
                mention(new.modified_by_id)
            ));
        }
        if old.resolved != new.resolved && !new.resolved {
            lines.push(format!(
                "{at}: Ticket was reopened by {}.",
                mention(new.modified_by_id)
            ));
        }
    }
    lines
}

/// Split lines into pages of at most `limit` characters
#[must_use]
pub fn paginate(lines: &[String], limit: usize) -> Vec<String> {
    let mut pages = Vec::new();
    let mut current = String::new();
    for line in lines {
        if !current.is_empty() && current.len() + line.len() + 1 > limit {
            pages.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
        while current.len() > limit {
            let mut cut = limit;
            while !current.is_char_boundary(cut) {
                cut -= 1;
            }
            let rest = current.split_off(cut);
            pages.push(std::mem::replace(&mut current, rest));
        }
    }
    if !current.is_empty() {
        pages.push(current);
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tickets::TicketChanges;
    use crate::tickets::record::tests::sample_ticket;
    use chrono::Duration;

    #[test]
    fn test_ticket_card() {
        let ticket = sample_ticket(3, 7);
        let card = ticket_card(&ticket, "BAN");
        assert_eq!(card.header, "Ticket #3");
        assert_eq!(card.title, format!("BAN {}", ticket.subject_id));
        assert_eq!(card.description, "**Acting moderator:** <@7>");
        assert_eq!(card.fields, vec![("Reason".to_string(), NO_REASON.to_string())]);
        assert_eq!(card.timestamp, Some(ticket.created_at));
    }

    #[test]
    fn test_note_card_field() {
        let mut ticket = sample_ticket(1, 7);
        ticket.action = ActionType::Note;
        ticket.reason = Some("talked to them".to_string());
        let card = ticket_card(&ticket, "NOTE");
        assert_eq!(card.fields[0].0, "Note");
        assert_eq!(card.fields[0].1, "talked to them");
    }

    #[test]
    fn test_summary_and_link() {
        let mut ticket = sample_ticket(2, 7);
        assert_eq!(
            ticket_summary(&ticket, "MUTED"),
            format!("(#2) MUTED {}", ticket.subject_id)
        );
        assert!(message_link(&ticket, 5).is_none());
        ticket.notification_message_id = Some(9);
        assert_eq!(
            message_link(&ticket, 5).unwrap(),
            "https://discord.com/channels/10/5/9"
        );
        assert!(user_log_line(&ticket, "BAN", 5).contains("[#2]("));

        ticket.notification_channel_id = Some(6);
        assert_eq!(
            message_link(&ticket, 5).unwrap(),
            "https://discord.com/channels/10/6/9"
        );
    }

    #[test]
    fn test_history_lines() {
        let created = sample_ticket(1, 7);
        let later = created.created_at + Duration::minutes(5);
        let reassigned = created.apply(&TicketChanges::reassign(8), 9, later);
        let resolved = reassigned.apply(&TicketChanges::resolve("raid"), 8, later);

        let lines = history_lines(&[created, reassigned, resolved]);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("created by <@7>"));
        assert!(lines[1].contains("moderator was changed to <@8> by <@9>"));
        assert!(lines[2].contains("reason was changed by <@8> to ```raid```"));
        assert!(history_lines(&[]).is_empty());
    }

    #[test]
    fn test_paginate() {
        let lines: Vec<String> = (0..5).map(|i| format!("line {i}")).collect();
        let pages = paginate(&lines, 13);
        assert_eq!(pages, vec!["line 0\nline 1", "line 2\nline 3", "line 4"]);

        let long = vec!["x".repeat(25)];
        let pages = paginate(&long, 10);
        assert_eq!(pages.len(), 3);
        assert!(pages.iter().all(|p| p.len() <= 10));
    }
}
