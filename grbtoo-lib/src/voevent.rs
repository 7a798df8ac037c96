//! VOEvent alert documents and VOEvent Transport Protocol control messages.
//!
//! References:
//! * VOEvent 2.0 <https://www.ivoa.net/documents/VOEvent/>
//! * VOEvent Transport Protocol <https://www.ivoa.net/documents/Notes/VOEventTransport/>
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use roxmltree::{Document, Node};
use serde::Serialize;
use tracing::warn;

use crate::{astro::Equatorial, Error, Result};

pub type PacketType = u32;

/// Namespace of the VTP `Transport` root element.
pub const TRANSPORT_NS: &str = "http://telescope-networks.org/schema/Transport/v1.1";
/// Namespaces accepted for the `VOEvent` root element.
pub const VOEVENT_NS: [&str; 2] = [
    "http://www.ivoa.net/xml/VOEvent/v1.1",
    "http://www.ivoa.net/xml/VOEvent/v2.0",
];

const GCN_IVORN_PREFIX: &str = "ivo://nasa.gsfc.gcn/";

const POSITION_PATH: [&str; 6] = [
    "WhereWhen",
    "ObsDataLocation",
    "ObservationLocation",
    "AstroCoords",
    "Position2D",
    "Value2",
];

/// Value of a `What/Param` element, typed by inference from its `value` attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    fn infer(value: &str) -> Self {
        let value = value.trim();
        if let Ok(v) = value.parse::<i64>() {
            return ParamValue::Int(v);
        }
        if let Ok(v) = value.parse::<f64>() {
            return ParamValue::Float(v);
        }
        ParamValue::Text(value.to_string())
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Position text exactly as found in `Position2D/Value2`.
///
/// Kept as text so validation happens where the position is used, see
/// [AlertDocument::position].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawPosition {
    pub c1: String,
    pub c2: String,
}

/// One parsed alert notice.
///
/// Immutable once parsed; consumers only ever borrow it.
#[derive(Debug, Clone, Serialize)]
pub struct AlertDocument {
    pub ivorn: String,
    /// VOEvent role, e.g., `observation` or `test`.
    pub role: Option<String>,
    /// GCN packet type; `None` for events from other brokers or with an unusable value.
    pub packet_type: Option<PacketType>,
    pub position: Option<RawPosition>,
    /// Position error radius in degrees, if provided.
    pub error_radius: Option<f64>,
    pub params: BTreeMap<String, ParamValue>,
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl AlertDocument {
    /// Parse a VOEvent payload.
    ///
    /// # Errors
    /// [Error::MalformedPayload] if the payload is not XML, is not a VOEvent, or lacks the
    /// ivorn.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| Error::MalformedPayload(format!("payload is not utf-8: {err}")))?;
        let doc = Document::parse(text)?;
        let root = doc.root_element();
        if !is_voevent(root) {
            return Err(Error::MalformedPayload(format!(
                "unexpected root element {:?}",
                root.tag_name()
            )));
        }
        Self::from_root(root, payload)
    }

    fn from_root(root: Node, payload: &[u8]) -> Result<Self> {
        let ivorn = root
            .attribute("ivorn")
            .ok_or_else(|| Error::MalformedPayload("VOEvent has no ivorn".into()))?
            .to_string();

        let mut params = BTreeMap::default();
        if let Some(what) = child(root, "What") {
            collect_params(what, &mut params);
            for group in elements(what, "Group") {
                collect_params(group, &mut params);
            }
        }

        let packet_type = match params.get("Packet_Type") {
            Some(ParamValue::Int(v)) => match PacketType::try_from(*v) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(%ivorn, packet_type = *v, "packet type out of range");
                    None
                }
            },
            Some(other) => {
                warn!(%ivorn, packet_type = %other, "packet type is not an integer");
                None
            }
            None => {
                warn!(%ivorn, "VOEvent has no Packet_Type param");
                None
            }
        };

        let position2d = find(root, &POSITION_PATH[..5]);
        let position = find(root, &POSITION_PATH).map(|value2| RawPosition {
            c1: child_text(value2, "C1"),
            c2: child_text(value2, "C2"),
        });
        let error_radius = position2d
            .and_then(|p| child(p, "Error2Radius"))
            .and_then(|n| n.text())
            .and_then(|t| t.trim().parse::<f64>().ok());

        Ok(AlertDocument {
            ivorn,
            role: root.attribute("role").map(str::to_string),
            packet_type,
            position,
            error_radius,
            params,
            raw: payload.to_vec(),
        })
    }

    /// Validated sky position of the event.
    ///
    /// # Errors
    /// [Error::InvalidPosition] if the position is missing or either coordinate is not a finite
    /// number of degrees.
    pub fn position(&self) -> Result<Equatorial> {
        let Some(ref pos) = self.position else {
            return Err(Error::InvalidPosition(format!("{}: no position", self.ivorn)));
        };
        let parse = |name: &str, s: &str| -> Result<f64> {
            match s.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(Error::InvalidPosition(format!(
                    "{}: {name}={s:?} is not a finite number",
                    self.ivorn
                ))),
            }
        };
        let ra = parse("ra", &pos.c1)?;
        let dec = parse("dec", &pos.c2)?;
        if !(-90.0..=90.0).contains(&dec) {
            return Err(Error::InvalidPosition(format!(
                "{}: dec={dec} out of range",
                self.ivorn
            )));
        }
        Ok(Equatorial { ra, dec })
    }

    /// Identifier usable as a file stem.
    ///
    /// GCN ivorns drop their authority prefix; path separators and fragment markers are
    /// replaced with `_`.
    #[must_use]
    pub fn event_id(&self) -> String {
        let id = self
            .ivorn
            .strip_prefix(GCN_IVORN_PREFIX)
            .or_else(|| self.ivorn.strip_prefix("ivo://"))
            .unwrap_or(&self.ivorn);
        id.replace(['/', '#', ':', '\\'], "_")
    }

    #[must_use]
    pub fn is_test(&self) -> bool {
        self.role.as_deref() == Some("test")
    }
}

/// VTP transport control message.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub role: Option<String>,
    pub origin: Option<String>,
}

/// Any document received on a VTP stream.
#[derive(Debug, Clone)]
pub enum Message {
    Transport(TransportMessage),
    VOEvent(AlertDocument),
    /// Well-formed XML with a root that is neither of the above; holds the root tag.
    Unknown(String),
}

impl Message {
    /// Parse a single VTP payload.
    ///
    /// # Errors
    /// [Error::MalformedPayload] if the payload is not well-formed XML or is a VOEvent without
    /// an ivorn.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|err| Error::MalformedPayload(format!("payload is not utf-8: {err}")))?;
        let doc = Document::parse(text)?;
        let root = doc.root_element();

        if root.tag_name().name() == "Transport" && root.tag_name().namespace() == Some(TRANSPORT_NS)
        {
            return Ok(Message::Transport(TransportMessage {
                role: root.attribute("role").map(str::to_string),
                origin: child(root, "Origin").and_then(|n| n.text()).map(|s| s.trim().to_string()),
            }));
        }
        if is_voevent(root) {
            return Ok(Message::VOEvent(AlertDocument::from_root(root, payload)?));
        }
        Ok(Message::Unknown(match root.tag_name().namespace() {
            Some(ns) => format!("{{{ns}}}{}", root.tag_name().name()),
            None => root.tag_name().name().to_string(),
        }))
    }
}

const TRANSPORT_TEMPLATE: &str = concat!(
    "<?xml version='1.0' encoding='UTF-8'?>",
    "<trn:Transport role=\"{{ role }}\" version=\"1.0\" xmlns:trn=\"{{ ns }}\" ",
    "xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" ",
    "xsi:schemaLocation=\"{{ ns }} http://telescope-networks.org/schema/Transport-v1.1.xsd\">",
    "<Origin>{{ origin }}</Origin>",
    "<Response>{{ response }}</Response>",
    "<TimeStamp>{{ timestamp }}</TimeStamp>",
    "</trn:Transport>"
);

#[derive(Serialize)]
struct TransportData<'a> {
    role: &'a str,
    ns: &'a str,
    origin: &'a str,
    response: &'a str,
    timestamp: String,
}

fn templates() -> &'static Handlebars<'static> {
    static TEMPLATES: OnceLock<Handlebars<'static>> = OnceLock::new();
    TEMPLATES.get_or_init(|| {
        let mut hb = Handlebars::new();
        hb.set_strict_mode(true);
        assert!(hb
            .register_template_string("transport", TRANSPORT_TEMPLATE)
            .is_ok());
        hb
    })
}

/// Form a VTP transport response document, e.g., an `iamalive` reply or an `ack` receipt.
///
/// # Errors
/// [Error::Render] if the document cannot be rendered.
pub fn transport_response(
    role: &str,
    origin: &str,
    response: &str,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let data = TransportData {
        role,
        ns: TRANSPORT_NS,
        origin,
        response,
        timestamp: timestamp.format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
    };
    templates()
        .render("transport", &data)
        .map_err(|err| Error::Render(err.to_string()))
}

fn is_voevent(node: Node) -> bool {
    node.tag_name().name() == "VOEvent"
        && node
            .tag_name()
            .namespace()
            .is_some_and(|ns| VOEVENT_NS.contains(&ns))
}

fn elements<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
}

fn find<'a, 'input>(node: Node<'a, 'input>, path: &[&str]) -> Option<Node<'a, 'input>> {
    path.iter().try_fold(node, |cur, name| child(cur, name))
}

fn child_text(node: Node, name: &str) -> String {
    child(node, name)
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn collect_params(node: Node, params: &mut BTreeMap<String, ParamValue>) {
    for param in elements(node, "Param") {
        let (Some(name), Some(value)) = (param.attribute("name"), param.attribute("value")) else {
            continue;
        };
        params.insert(name.to_string(), ParamValue::infer(value));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn voevent(packet_type: &str, c1: &str, c2: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<voe:VOEvent ivorn="ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_1_1" role="observation" version="2.0"
    xmlns:voe="http://www.ivoa.net/xml/VOEvent/v2.0">
  <What>
    <Param name="Packet_Type" value="{packet_type}" />
    <Param name="Burst_Inten" value="2105" />
    <Group name="Misc_Flags"><Param name="Test_Submission" value="false" /></Group>
  </What>
  <WhereWhen><ObsDataLocation><ObservationLocation><AstroCoords coord_system_id="UTC-FK5-GEO">
    <Position2D unit="deg"><Value2><C1>{c1}</C1><C2>{c2}</C2></Value2>
    <Error2Radius>0.05</Error2Radius></Position2D>
  </AstroCoords></ObservationLocation></ObsDataLocation></WhereWhen>
</voe:VOEvent>"#
        )
    }

    #[test]
    fn parse_voevent() {
        let payload = voevent("61", "123.4567", "-45.6789");
        let alert = AlertDocument::parse(payload.as_bytes()).unwrap();

        assert_eq!(alert.ivorn, "ivo://nasa.gsfc.gcn/SWIFT#BAT_GRB_Pos_1_1");
        assert_eq!(alert.role.as_deref(), Some("observation"));
        assert_eq!(alert.packet_type, Some(61));
        assert_eq!(alert.error_radius, Some(0.05));
        assert_eq!(alert.params["Burst_Inten"], ParamValue::Int(2105));
        assert_eq!(
            alert.params["Test_Submission"],
            ParamValue::Text("false".into())
        );
        assert_eq!(alert.raw, payload.as_bytes());

        let pos = alert.position().unwrap();
        assert_eq!(pos.ra, 123.4567);
        assert_eq!(pos.dec, -45.6789);
    }

    #[test]
    fn missing_packet_type_still_parses() {
        let payload = voevent("61", "1", "2").replace("Packet_Type", "Other");
        let alert = AlertDocument::parse(payload.as_bytes()).unwrap();
        assert_eq!(alert.packet_type, None);
        assert_eq!(alert.params["Other"], ParamValue::Int(61));
        assert_eq!(alert.raw, payload.as_bytes());
    }

    #[test]
    fn unusable_packet_type_is_none() {
        let alert = AlertDocument::parse(voevent("abc", "1", "2").as_bytes()).unwrap();
        assert_eq!(alert.packet_type, None);
        let alert = AlertDocument::parse(voevent("-3", "1", "2").as_bytes()).unwrap();
        assert_eq!(alert.packet_type, None);
    }

    #[test]
    fn missing_ivorn_is_malformed() {
        let payload = voevent("61", "1", "2").replace("ivorn=", "id=");
        let zult = AlertDocument::parse(payload.as_bytes());
        assert!(matches!(zult, Err(Error::MalformedPayload(_))), "{zult:?}");
    }

    #[test]
    fn broken_xml_is_malformed() {
        let payload = voevent("61", "1", "2");
        let zult = AlertDocument::parse(&payload.as_bytes()[..payload.len() / 2]);
        assert!(matches!(zult, Err(Error::MalformedPayload(_))), "{zult:?}");
    }

    #[test]
    fn non_numeric_position_is_invalid() {
        let alert = AlertDocument::parse(voevent("61", "abc", "2").as_bytes()).unwrap();
        assert!(matches!(alert.position(), Err(Error::InvalidPosition(_))));

        let alert = AlertDocument::parse(voevent("61", "NaN", "2").as_bytes()).unwrap();
        assert!(matches!(alert.position(), Err(Error::InvalidPosition(_))));

        let alert = AlertDocument::parse(voevent("61", "10", "95").as_bytes()).unwrap();
        assert!(matches!(alert.position(), Err(Error::InvalidPosition(_))));
    }

    #[test]
    fn event_id_strips_gcn_prefix() {
        let alert = AlertDocument::parse(voevent("61", "1", "2").as_bytes()).unwrap();
        assert_eq!(alert.event_id(), "SWIFT_BAT_GRB_Pos_1_1");
    }

    #[test]
    fn parse_transport_iamalive() {
        let payload = transport_response("iamalive", "ivo://gcn", "", Utc::now()).unwrap();
        let Message::Transport(msg) = Message::parse(payload.as_bytes()).unwrap() else {
            panic!("expected transport message");
        };
        assert_eq!(msg.role.as_deref(), Some("iamalive"));
        assert_eq!(msg.origin.as_deref(), Some("ivo://gcn"));
    }

    #[test]
    fn parse_unknown_root() {
        let msg = Message::parse(b"<foo xmlns='urn:x'/>").unwrap();
        assert!(matches!(msg, Message::Unknown(ref tag) if tag == "{urn:x}foo"), "{msg:?}");
    }

    #[test]
    fn response_escapes_content() {
        let xml = transport_response("ack", "ivo://a#b&c<d>", "ivo://me", Utc::now()).unwrap();
        assert!(xml.contains("<Origin>ivo://a#b&amp;c&lt;d&gt;</Origin>"), "{xml}");

        let doc = Document::parse(&xml).unwrap();
        let root = doc.root_element();
        assert_eq!(root.tag_name().namespace(), Some(TRANSPORT_NS));
        assert_eq!(root.attribute("role"), Some("ack"));
        assert_eq!(child_text(root, "Origin"), "ivo://a#b&c<d>");
        assert_eq!(child_text(root, "Response"), "ivo://me");
    }
}
