use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use handlebars::{handlebars_helper, Handlebars};
use serde::Serialize;
use tracing::{debug, info};

use crate::{voevent::AlertDocument, Error, Result};

/// Paths and public location of an archived alert.
#[derive(Debug, Clone)]
pub struct Archived {
    pub url: String,
    pub html: String,
    pub raw_path: PathBuf,
    pub html_path: PathBuf,
}

/// Stores each alert as its raw payload and a rendered HTML page.
///
/// Files are `{events_dir}/raw/{id}.xml` and `{events_dir}/html/{id}.html` where `id` is
/// [AlertDocument::event_id]. Archiving the same event again replaces both files.
pub struct Archiver {
    events_dir: PathBuf,
    www: String,
    hb: Handlebars<'static>,
}

#[derive(Serialize)]
struct Param<'a> {
    name: &'a str,
    value: String,
}

#[derive(Serialize)]
struct RenderData<'a> {
    ivorn: &'a str,
    event_id: String,
    role: Option<&'a str>,
    packet_type: String,
    ra: Option<&'a str>,
    dec: Option<&'a str>,
    error_radius: Option<f64>,
    params: Vec<Param<'a>>,
    archived: String,
    raw: String,
}

impl Archiver {
    pub fn new<P: Into<PathBuf>, S: Into<String>>(events_dir: P, www: S) -> Self {
        let mut hb = Handlebars::new();
        handlebars_helper!(deg: |v: f64| format!("{v:.4}"));
        hb.register_helper("deg", Box::new(deg));
        assert!(hb.register_template_string("alert", HTML_TEMPLATE).is_ok());

        Archiver {
            events_dir: events_dir.into(),
            www: www.into(),
            hb,
        }
    }

    #[must_use]
    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    /// Public URL of the rendered page for `event_id`.
    #[must_use]
    pub fn url(&self, event_id: &str) -> String {
        format!("{}/html/{event_id}.html", self.www.trim_end_matches('/'))
    }

    /// Render `alert` as an HTML page.
    ///
    /// # Errors
    /// [Error::Render] if the template fails to render.
    pub fn render(&self, alert: &AlertDocument) -> Result<String> {
        let data = RenderData {
            ivorn: &alert.ivorn,
            event_id: alert.event_id(),
            role: alert.role.as_deref(),
            packet_type: alert
                .packet_type
                .map_or_else(|| "-".to_string(), |t| t.to_string()),
            ra: alert.position.as_ref().map(|p| p.c1.as_str()),
            dec: alert.position.as_ref().map(|p| p.c2.as_str()),
            error_radius: alert.error_radius,
            params: alert
                .params
                .iter()
                .map(|(name, value)| Param {
                    name,
                    value: value.to_string(),
                })
                .collect(),
            archived: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            raw: String::from_utf8_lossy(&alert.raw).into_owned(),
        };
        self.hb
            .render("alert", &data)
            .map_err(|err| Error::Render(err.to_string()))
    }

    /// Write the raw payload and rendered page for `alert`.
    ///
    /// # Errors
    /// [Error::Render] if rendering fails, or [Error::Stream] on filesystem errors. An
    /// existing archive for the same event is left intact on failure.
    pub fn archive(&self, alert: &AlertDocument) -> Result<Archived> {
        let id = alert.event_id();
        let html = self.render(alert)?;

        let raw_path = self.events_dir.join("raw").join(format!("{id}.xml"));
        let html_path = self.events_dir.join("html").join(format!("{id}.html"));
        write_replace(&raw_path, &alert.raw)?;
        write_replace(&html_path, html.as_bytes())?;

        let url = self.url(&id);
        info!(ivorn = %alert.ivorn, %url, "archived alert");
        Ok(Archived {
            url,
            html,
            raw_path,
            html_path,
        })
    }
}

/// Write `data` to a temporary file next to `path` and rename it into place.
fn write_replace(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Config(format!("{} has no parent directory", path.display())))?;
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    debug!(path = %path.display(), bytes = data.len(), "wrote");
    Ok(())
}

const HTML_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>{{ event_id }}</title>
<style>
  body { font-family: sans-serif; }
  th { text-align: left; padding-right: 2em; }
  pre { background: #f4f4f4; padding: 1em; overflow-x: auto; }
</style>
</head>
<body>
<h1>{{ ivorn }}</h1>
<table>
  <tr><th>Role</th><td>{{#if role}}{{ role }}{{else}}unknown{{/if}}</td></tr>
  <tr><th>Packet type</th><td>{{ packet_type }}</td></tr>
  <tr><th>RA</th><td>{{#if ra}}{{ ra }}{{else}}-{{/if}}</td></tr>
  <tr><th>Dec</th><td>{{#if dec}}{{ dec }}{{else}}-{{/if}}</td></tr>
  <tr><th>Error radius</th><td>{{#if error_radius}}{{ deg error_radius }} deg{{else}}-{{/if}}</td></tr>
  <tr><th>Archived</th><td>{{ archived }}</td></tr>
</table>
<h2>Parameters</h2>
<table>
{{#each params}}
  <tr><th>{{ name }}</th><td>{{ value }}</td></tr>
{{/each}}
</table>
<h2>VOEvent</h2>
<pre>{{ raw }}</pre>
</body>
</html>
"#;
