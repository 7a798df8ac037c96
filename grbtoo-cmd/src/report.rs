use std::io::{stdout, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use grbtoo::{
    astro::{parse_dec, parse_ra, to_galactic, DustMap, Ephemeris, Equatorial, Galactic, Horizontal},
    config::Config,
    decision::{AdmissionDecision, DecisionEngine},
    sequencer::ExposurePlan,
    voevent::AlertDocument,
};
use handlebars::handlebars_helper;
use serde::Serialize;

use crate::listen::archiver;

#[derive(Debug, Clone)]
pub enum Format {
    Json,
    Text,
}

impl clap::ValueEnum for Format {
    fn value_variants<'a>() -> &'a [Self] {
        &[Self::Json, Self::Text]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            Self::Json => Some(clap::builder::PossibleValue::new("json")),
            Self::Text => Some(clap::builder::PossibleValue::new("text")),
        }
    }
}

fn write<T: Serialize>(data: &T, format: &Format, template: &str) -> Result<()> {
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(stdout(), data).context("serializing to json")?;
            println!();
            Ok(())
        }
        Format::Text => {
            let text = render_text(data, template)?;
            stdout()
                .write_all(text.as_bytes())
                .context("writing to stdout")
        }
    }
}

fn render_text<T: Serialize>(data: &T, template: &str) -> Result<String> {
    handlebars_helper!(deg: |v: Json| {
        match v.as_f64() {
            Some(v) => format!("{v:8.3}"),
            None => "       -".to_string(),
        }
    });
    let mut hb = handlebars::Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    hb.register_helper("deg", Box::new(deg));
    hb.register_template_string("text", template)
        .context("registering template")?;

    hb.render("text", data).context("rendering text")
}

fn load_alert(path: &Path) -> Result<AlertDocument> {
    let payload = std::fs::read(path).with_context(|| format!("reading {path:?}"))?;
    AlertDocument::parse(&payload).with_context(|| format!("parsing {path:?}"))
}

pub fn evaluate(config_path: &Path, input: &Path, format: &Format) -> Result<()> {
    let config = Config::load(config_path).context("loading config")?;
    let alert = load_alert(input)?;
    let engine = DecisionEngine::new(
        config.criteria(),
        Box::new(config.site),
        Box::new(config.dust()),
    );
    let decision: AdmissionDecision = engine.evaluate(&alert).context("evaluating alert")?;
    write(&decision, format, DECISION_TEMPLATE)
}

#[derive(Debug, Serialize)]
struct TargetReport {
    time: DateTime<Utc>,
    position: Equatorial,
    galactic: Galactic,
    horizontal: Horizontal,
    moon: Horizontal,
    moon_distance: f64,
    ebv: f64,
    observable: bool,
}

/// Manual target check, replacing the chat bot's `/set` command.
pub fn target(config_path: &Path, ra: &str, dec: &str, format: &Format) -> Result<()> {
    let config = Config::load(config_path).context("loading config")?;
    let position = Equatorial {
        ra: parse_ra(ra).context("parsing ra")?,
        dec: parse_dec(dec).context("parsing dec")?,
    };

    let site = config.site;
    let time = site.now();
    let horizontal = site.alt_az(position, time)?;
    let moon = site.moon_position(time)?;
    let galactic = to_galactic(position);
    let ebv = config.dust().ebv(galactic)?;
    let criteria = config.criteria();

    let report = TargetReport {
        time,
        position,
        galactic,
        horizontal,
        moon,
        moon_distance: horizontal.separation(&moon),
        ebv,
        observable: horizontal.alt >= criteria.min_alt && ebv <= criteria.ebv_max,
    };
    write(&report, format, TARGET_TEMPLATE)
}

pub fn plan(path: &Path, format: &Format) -> Result<()> {
    let plan = ExposurePlan::load(path).context("loading exposure plan")?;
    write(&plan, format, PLAN_TEMPLATE)
}

pub fn archive(config_path: &Path, input: &Path) -> Result<()> {
    let config = Config::load(config_path).context("loading config")?;
    let Some(archiver) = archiver(&config) else {
        bail!("archiving requires gcn.events_dir and gcn.www in {config_path:?}");
    };
    let alert = load_alert(input)?;
    let archived = archiver.archive(&alert).context("archiving alert")?;
    println!("{}", archived.url);
    Ok(())
}

const DECISION_TEMPLATE: &str = r"{{ ivorn }}
===============================================================================
Packet type:   {{ packet_type }}
Verdict:       {{ verdict }}{{ #if reason }} ({{ reason }}){{ /if }}
RA:           {{ deg position.ra }}
Dec:          {{ deg position.dec }}
Altitude:     {{ deg altitude }}
E(B-V):       {{ deg ebv }}
Moon dist:    {{ deg moon_distance }}
";

const TARGET_TEMPLATE: &str = r"Target at {{ time }}
===============================================================================
RA, Dec:      {{ deg position.ra }} {{ deg position.dec }}
l, b:         {{ deg galactic.l }} {{ deg galactic.b }}
Alt, Az:      {{ deg horizontal.alt }} {{ deg horizontal.az }}
Moon alt, az: {{ deg moon.alt }} {{ deg moon.az }}
Moon dist:    {{ deg moon_distance }}
E(B-V):       {{ deg ebv }}
Observable:   {{ observable }}
";

const PLAN_TEMPLATE: &str = r"Step  Filter      Exptime  Frames
-------------------------------------
{{ #each this }}{{ @index }}     {{ filter }}           {{ exptime }}        {{ frames }}
{{ /each }}";
