//! Message templates for switch releases.

use super::Notification;

/// Content for the message sent when a switch fires.
pub struct SwitchReleaseEmail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

impl SwitchReleaseEmail {
    /// `note` is delivered verbatim in the text part and escaped in the HTML part.
    pub fn new(note: &str, sender_label: &str) -> Self {
        Self {
            subject: format!("A message was left for you on {sender_label}"),
            text: Self::text_template(note, sender_label),
            html: Self::html_template(note, sender_label),
        }
    }

    pub fn into_notification(self, to: &str) -> Notification {
        Notification {
            to: to.to_owned(),
            subject: self.subject,
            text: self.text,
            html: self.html,
        }
    }

    fn text_template(note: &str, sender_label: &str) -> String {
        format!(
            r#"Someone named you as the recipient of a message on {sender_label}.

They asked for it to be delivered if they stopped checking in, and they have
not checked in within the period they chose.

----- message -----
{note}
-------------------

--
{sender_label}"#
        )
    }

    fn html_template(note: &str, sender_label: &str) -> String {
        let note = escape_html(note);
        let sender_label = escape_html(sender_label);
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; margin: 0; padding: 0; background: #f5f5f5; }}
        .container {{ max-width: 600px; margin: 0 auto; padding: 40px 20px; }}
        .card {{ background: white; border-radius: 8px; padding: 40px; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }}
        .note {{ white-space: pre-wrap; padding: 24px; background: #f7f7f7; border-radius: 8px; margin: 24px 0; font-family: 'SF Mono', Monaco, monospace; }}
        .footer {{ margin-top: 32px; padding-top: 20px; border-top: 1px solid #eee; color: #888; font-size: 12px; }}
    </style>
</head>
<body>
    <div class="container">
        <div class="card">
            <p>Someone named you as the recipient of a message on {sender_label}.</p>
            <p>They asked for it to be delivered if they stopped checking in, and they have not checked in within the period they chose.</p>
            <div class="note">{note}</div>
            <div class="footer">{sender_label}</div>
        </div>
    </div>
</body>
</html>"#
        )
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
