//! HTML rendering for emails and the public viewing page

use crate::database::{Attachment, Location, Message};
use crate::domain::format_duration;
use chrono::{DateTime, Utc};

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
body {{ font-family: system-ui, sans-serif; max-width: 640px; margin: 3rem auto; padding: 0 1rem; color: #1f2933; }}
.card {{ border: 1px solid #d9e2ec; border-radius: 8px; padding: 1.5rem; }}
.muted {{ color: #627d98; }}
.error {{ color: #b42318; }}
</style>
</head>
<body>
<div class="card">
{body}
</div>
</body>
</html>"#,
        title = escape_html(title),
        body = body
    )
}

fn format_date(at: DateTime<Utc>) -> String {
    at.format("%B %-d, %Y at %H:%M UTC").to_string()
}

// ===== Emails =====

pub fn notification_email(
    recipient_name: &str,
    title: &str,
    link: &str,
    is_emergency: bool,
) -> String {
    let intro = if is_emergency {
        "<p><strong>This is an emergency message.</strong> It was sent because the sender triggered an alert.</p>"
    } else {
        "<p>A message has been left for you and its delivery conditions have now been met.</p>"
    };

    let body = format!(
        r#"<h2>Hello {name},</h2>
{intro}
<p><strong>{title}</strong></p>
<p><a href="{link}">Open the message</a></p>
<p class="muted">The link is personal to you. Do not forward it.</p>"#,
        name = escape_html(recipient_name),
        intro = intro,
        title = escape_html(title),
        link = escape_html(link)
    );
    layout(title, &body)
}

pub fn reminder_email(title: &str, deadline: DateTime<Utc>, remaining_minutes: u32) -> String {
    let body = format!(
        r#"<h2>Check-in reminder</h2>
<p>Your message <strong>{title}</strong> will be delivered in {remaining} unless you check in.</p>
<p class="muted">Deadline: {deadline}</p>"#,
        title = escape_html(title),
        remaining = format_duration(remaining_minutes),
        deadline = format_date(deadline)
    );
    layout("Check-in reminder", &body)
}

// ===== Viewing page =====

pub fn error_page(message: &str) -> String {
    layout(
        "Message unavailable",
        &format!(
            r#"<h2>Message unavailable</h2><p class="error">{}</p>"#,
            escape_html(message)
        ),
    )
}

pub fn expired_page(expired_at: DateTime<Utc>) -> String {
    layout(
        "Message expired",
        &format!(
            "<h2>This message has expired</h2><p>Access ended on {}.</p>",
            format_date(expired_at)
        ),
    )
}

pub fn locked_page(unlock_at: DateTime<Utc>) -> String {
    layout(
        "Message locked",
        &format!(
            "<h2>This message is not available yet</h2><p>It unlocks on {}.</p>",
            format_date(unlock_at)
        ),
    )
}

pub fn pin_page(message_id: &str, delivery_id: &str, recipient_email: &str) -> String {
    let body = format!(
        r#"<h2>PIN required</h2>
<p>Enter the PIN the sender shared with you.</p>
<form id="pin-form">
<input id="pin" type="password" inputmode="numeric" autocomplete="off" required>
<button type="submit">Unlock</button>
</form>
<p id="pin-error" class="error"></p>
<script>
document.getElementById("pin-form").addEventListener("submit", async (event) => {{
  event.preventDefault();
  const response = await fetch("/access/verify-pin", {{
    method: "POST",
    headers: {{ "Content-Type": "application/json" }},
    body: JSON.stringify({{
      pin: document.getElementById("pin").value,
      messageId: "{message_id}",
      deliveryId: "{delivery_id}",
      recipientEmail: "{recipient_email}"
    }})
  }});
  const result = await response.json();
  if (result.success) {{
    window.location.reload();
  }} else {{
    document.getElementById("pin-error").textContent = result.error || "Incorrect PIN";
  }}
}});
</script>"#,
        message_id = escape_html(message_id),
        delivery_id = escape_html(delivery_id),
        recipient_email = escape_html(recipient_email)
    );
    layout("PIN required", &body)
}

fn attachments_html(attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return String::new();
    }
    let items: String = attachments
        .iter()
        .map(|a| {
            format!(
                "<li>{} <span class=\"muted\">({} bytes)</span></li>",
                escape_html(&a.name),
                a.size
            )
        })
        .collect();
    format!("<h3>Attachments</h3><ul>{}</ul>", items)
}

fn location_html(location: Option<Location>) -> String {
    match location {
        Some(loc) => format!(
            "<h3>Location</h3><p>{} ({:.5}, {:.5})</p>",
            escape_html(loc.name.as_deref().unwrap_or("Shared location")),
            loc.latitude,
            loc.longitude
        ),
        None => String::new(),
    }
}

pub fn message_page(message: &Message, delivery_id: Option<&str>) -> String {
    let content = message
        .content
        .as_deref()
        .map(|c| escape_html(c).replace('\n', "<br>"))
        .unwrap_or_default();

    let record_view = match delivery_id {
        Some(delivery_id) => format!(
            r#"<script>
fetch("/access/record-view", {{
  method: "POST",
  headers: {{ "Content-Type": "application/json" }},
  body: JSON.stringify({{ messageId: "{message_id}", deliveryId: "{delivery_id}" }})
}});
</script>"#,
            message_id = escape_html(&message.id),
            delivery_id = escape_html(delivery_id)
        ),
        None => String::new(),
    };

    let body = format!(
        "<h2>{title}</h2><div>{content}</div>{attachments}{location}{record_view}",
        title = escape_html(&message.title),
        content = content,
        attachments = attachments_html(&message.attachment_list()),
        location = location_html(message.location()),
        record_view = record_view
    );
    layout(&message.title, &body)
}
