//! Notification email composer.
//!
//! Each content type has a fixed subject/HTML/text template with
//! `{{placeholder}}` slots. Missing optional fields fall back to defaults;
//! only fields needed to build the post link are required.

use crate::config::Site;
use crate::model::{ContentItem, ContentType, Subscriber};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(\w+)\}\}").expect("placeholder regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

struct Template {
    subject: &'static str,
    html: &'static str,
    text: &'static str,
}

const BLOG: Template = Template {
    subject: "New Blog Post: {{title}}",
    html: r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{{title}}</title>
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
<div style="background: #f8f9fa; padding: 20px; border-radius: 8px; margin-bottom: 30px;">
<h1>{{title}}</h1>
<div style="color: #666; font-size: 14px;">Published on {{publish_date}}</div>
</div>
<p>Hi {{user_name}},</p>
<p>A new post is up on {{site_name}}:</p>
<h2>{{title}}</h2>
<p>{{description}}</p>
<p><strong>Tags:</strong> {{tags}}</p>
<p><a href="{{url}}" style="background: #007bff; color: white; padding: 12px 24px; text-decoration: none; border-radius: 4px;">Read Full Post</a></p>
<div style="border-top: 1px solid #eee; padding-top: 20px; font-size: 12px; color: #666;">
<p>{{site_name}} &middot; <a href="{{site_url}}">{{site_url}}</a></p>
<p style="font-size: 11px; color: #999;"><a href="{{unsubscribe_url}}">Unsubscribe</a> from these notifications</p>
</div>
</body>
</html>
"#,
    text: "Hi {{user_name}},

A new post is up on {{site_name}}: {{title}}

{{description}}

Published on: {{publish_date}}
Tags: {{tags}}

Read the full post: {{url}}

--
{{site_name}} ({{site_url}})
To unsubscribe from these notifications, visit: {{unsubscribe_url}}
",
};

const THOUGHT: Template = Template {
    subject: "New Thought: {{title}}",
    html: r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{{title}}</title>
</head>
<body style="font-family: Arial, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
<div style="background: #f8f9fa; padding: 20px; border-radius: 8px; margin-bottom: 30px;">
<h1>{{title}}</h1>
<div style="color: #666; font-size: 14px;">Published on {{publish_date}}</div>
</div>
<p>Hi {{user_name}},</p>
<p>A new thought is up on {{site_name}}:</p>
<div style="background: #f8f9fa; padding: 15px; border-radius: 8px; margin: 20px 0; font-style: italic;">{{description}}</div>
<p><strong>Tags:</strong> {{tags}}</p>
<p><a href="{{url}}" style="background: #28a745; color: white; padding: 12px 24px; text-decoration: none; border-radius: 4px;">Read Full Thought</a></p>
<div style="border-top: 1px solid #eee; padding-top: 20px; font-size: 12px; color: #666;">
<p>{{site_name}} &middot; <a href="{{site_url}}">{{site_url}}</a></p>
<p style="font-size: 11px; color: #999;"><a href="{{unsubscribe_url}}">Unsubscribe</a> from these notifications</p>
</div>
</body>
</html>
"#,
    text: "Hi {{user_name}},

A new thought is up on {{site_name}}: {{title}}

{{description}}

Published on: {{publish_date}}
Tags: {{tags}}

Read the full thought: {{url}}

--
{{site_name}} ({{site_url}})
To unsubscribe from these notifications, visit: {{unsubscribe_url}}
",
};

fn template_for(content_type: ContentType) -> &'static Template {
    match content_type {
        ContentType::Blog => &BLOG,
        ContentType::Thought => &THOUGHT,
    }
}

/// Public link to a content item.
pub fn content_url(site: &Site, item: &ContentItem) -> Result<String, TemplateError> {
    let base = site.url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(TemplateError::MissingField("site_url"));
    }
    let slug = item.slug.trim();
    if slug.is_empty() {
        return Err(TemplateError::MissingField("slug"));
    }
    Ok(format!("{}/{}/{}", base, item.content_type.url_segment(), slug))
}

/// One-click unsubscribe link for a subscriber.
pub fn unsubscribe_url(site: &Site, subscriber: &Subscriber) -> String {
    format!(
        "{}/api/user/unsubscribe?token={}",
        site.url.trim().trim_end_matches('/'),
        subscriber.unsubscribe_token
    )
}

/// Render the notification for `item` addressed to `subscriber`.
pub fn render(
    item: &ContentItem,
    subscriber: &Subscriber,
    site: &Site,
) -> Result<RenderedEmail, TemplateError> {
    let url = content_url(site, item)?;

    let title = match item.title.trim() {
        "" => match item.content_type {
            ContentType::Blog => "New Blog Post".to_string(),
            ContentType::Thought => "New Thought".to_string(),
        },
        t => t.to_string(),
    };
    let description = item
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(item.content_preview.trim())
        .to_string();
    let user_name = subscriber
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or("there")
        .to_string();

    let mut vars: HashMap<&'static str, String> = HashMap::new();
    vars.insert("title", title);
    vars.insert("description", description);
    vars.insert("url", url);
    vars.insert("publish_date", item.publish_date.format("%B %-d, %Y").to_string());
    vars.insert("tags", item.tags.join(", "));
    vars.insert("site_name", site.name.clone());
    vars.insert("site_url", site.url.trim_end_matches('/').to_string());
    vars.insert("unsubscribe_url", unsubscribe_url(site, subscriber));
    vars.insert("user_name", user_name);

    let template = template_for(item.content_type);
    Ok(RenderedEmail {
        subject: interpolate(template.subject, &vars, false),
        html: interpolate(template.html, &vars, true),
        text: interpolate(template.text, &vars, false),
    })
}

/// Replace `{{key}}` slots; unknown keys are left as-is.
fn interpolate(template: &str, vars: &HashMap<&'static str, String>, escape: bool) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let key = &caps[1];
            match vars.get(key) {
                Some(value) if escape => escape_html(value),
                Some(value) => value.clone(),
                None => {
                    warn!(key, "template variable not found");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
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
