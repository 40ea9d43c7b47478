//! Minimal XML-RPC codec: method calls out, method responses in.

use anyhow::Result;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::error::MirrorError;

#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Nil,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    DateTime(String),
    /// Encoded payload, kept as received.
    Base64(String),
    Array(Vec<RpcValue>),
    Struct(Vec<(String, RpcValue)>),
}

impl RpcValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array(values.into_iter().map(Self::string).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) | Self::DateTime(value) => Some(value),
            _ => None,
        }
    }

    pub fn member(&self, name: &str) -> Option<&RpcValue> {
        match self {
            Self::Struct(members) => members
                .iter()
                .find(|(member, _)| member == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "boolean",
            Self::Int(_) => "int",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::DateTime(_) => "dateTime.iso8601",
            Self::Base64(_) => "base64",
            Self::Array(_) => "array",
            Self::Struct(_) => "struct",
        }
    }
}

/// Build a struct argument from `(name, value)` pairs.
pub fn rpc_struct<I, S>(members: I) -> RpcValue
where
    I: IntoIterator<Item = (S, RpcValue)>,
    S: Into<String>,
{
    RpcValue::Struct(
        members
            .into_iter()
            .map(|(name, value)| (name.into(), value))
            .collect(),
    )
}

pub fn encode_call(method: &str, params: &[RpcValue]) -> Result<String> {
    let mut writer = Writer::new(Vec::new());
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    start(&mut writer, "methodCall")?;
    text_element(&mut writer, "methodName", method)?;
    start(&mut writer, "params")?;
    for param in params {
        start(&mut writer, "param")?;
        write_value(&mut writer, param)?;
        end(&mut writer, "param")?;
    }
    end(&mut writer, "params")?;
    end(&mut writer, "methodCall")?;
    Ok(String::from_utf8(writer.into_inner())?)
}

fn write_value(writer: &mut Writer<Vec<u8>>, value: &RpcValue) -> Result<()> {
    start(writer, "value")?;
    match value {
        RpcValue::Nil => {
            writer.write_event(Event::Empty(BytesStart::new("nil")))?;
        }
        RpcValue::Bool(flag) => text_element(writer, "boolean", if *flag { "1" } else { "0" })?,
        RpcValue::Int(number) => text_element(writer, "int", &number.to_string())?,
        RpcValue::Double(number) => text_element(writer, "double", &number.to_string())?,
        RpcValue::String(text) => text_element(writer, "string", text)?,
        RpcValue::DateTime(text) => text_element(writer, "dateTime.iso8601", text)?,
        RpcValue::Base64(text) => text_element(writer, "base64", text)?,
        RpcValue::Array(items) => {
            start(writer, "array")?;
            start(writer, "data")?;
            for item in items {
                write_value(writer, item)?;
            }
            end(writer, "data")?;
            end(writer, "array")?;
        }
        RpcValue::Struct(members) => {
            start(writer, "struct")?;
            for (name, member) in members {
                start(writer, "member")?;
                text_element(writer, "name", name)?;
                write_value(writer, member)?;
                end(writer, "member")?;
            }
            end(writer, "struct")?;
        }
    }
    end(writer, "value")
}

fn start(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    Ok(())
}

fn end(writer: &mut Writer<Vec<u8>>, name: &str) -> Result<()> {
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, text: &str) -> Result<()> {
    start(writer, name)?;
    if !text.is_empty() {
        writer.write_event(Event::Text(BytesText::new(text)))?;
    }
    end(writer, name)
}

/// Decode a `<methodResponse>` body into its single return value.
/// A `<fault>` becomes [`MirrorError::RemoteFault`].
pub fn decode_response(body: &str) -> Result<RpcValue, MirrorError> {
    let mut reader = Reader::from_str(body);
    let mut in_fault = false;
    loop {
        match next_event(&mut reader)? {
            Event::Start(element) => match element.name().as_ref() {
                b"fault" => in_fault = true,
                b"value" => {
                    let value = parse_value(&mut reader)?;
                    if in_fault {
                        return Err(fault_from_value(&value));
                    }
                    return Ok(value);
                }
                _ => {}
            },
            Event::Empty(element) if element.name().as_ref() == b"value" => {
                return Ok(RpcValue::String(String::new()));
            }
            Event::Eof => return Err(protocol("response contains no value")),
            _ => {}
        }
    }
}

fn fault_from_value(value: &RpcValue) -> MirrorError {
    let code = match value.member("faultCode") {
        Some(RpcValue::Int(code)) => *code,
        _ => 0,
    };
    let message = value
        .member("faultString")
        .and_then(RpcValue::as_str)
        .unwrap_or("unknown fault")
        .to_string();
    MirrorError::RemoteFault { code, message }
}

fn next_event<'a>(reader: &mut Reader<&'a [u8]>) -> Result<Event<'a>, MirrorError> {
    reader
        .read_event()
        .map_err(|error| protocol(format!("invalid XML: {error}")))
}

fn protocol(message: impl Into<String>) -> MirrorError {
    MirrorError::Protocol(message.into())
}

fn tag_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.name().as_ref()).into_owned()
}

fn unescape_text(text: &BytesText<'_>) -> Result<String, MirrorError> {
    text.unescape()
        .map(|value| value.into_owned())
        .map_err(|error| protocol(format!("invalid text content: {error}")))
}

// Called right after `<value>`. A value without a type element is a string.
fn parse_value(reader: &mut Reader<&[u8]>) -> Result<RpcValue, MirrorError> {
    let mut bare = String::new();
    let mut typed = None;
    loop {
        match next_event(reader)? {
            Event::Text(text) => bare.push_str(&unescape_text(&text)?),
            Event::CData(data) => bare.push_str(&String::from_utf8_lossy(&data.into_inner())),
            Event::Start(element) => {
                let name = tag_name(&element);
                typed = Some(parse_typed(reader, &name)?);
            }
            Event::Empty(element) => {
                let name = tag_name(&element);
                typed = Some(empty_typed(&name)?);
            }
            Event::End(element) if element.name().as_ref() == b"value" => {
                return Ok(typed.unwrap_or(RpcValue::String(bare)));
            }
            Event::End(element) => {
                return Err(protocol(format!(
                    "unexpected </{}> inside <value>",
                    String::from_utf8_lossy(element.name().as_ref())
                )));
            }
            Event::Eof => return Err(protocol("document ended inside <value>")),
            _ => {}
        }
    }
}

fn parse_typed(reader: &mut Reader<&[u8]>, name: &str) -> Result<RpcValue, MirrorError> {
    let value = match name {
        "string" => RpcValue::String(read_text(reader, name)?),
        "int" | "i4" | "i8" => {
            let text = read_text(reader, name)?;
            let number = text
                .trim()
                .parse::<i64>()
                .map_err(|_| protocol(format!("invalid <{name}> value {text:?}")))?;
            RpcValue::Int(number)
        }
        "boolean" => {
            let text = read_text(reader, name)?;
            match text.trim() {
                "1" => RpcValue::Bool(true),
                "0" => RpcValue::Bool(false),
                other => return Err(protocol(format!("invalid <boolean> value {other:?}"))),
            }
        }
        "double" => {
            let text = read_text(reader, name)?;
            let number = text
                .trim()
                .parse::<f64>()
                .map_err(|_| protocol(format!("invalid <double> value {text:?}")))?;
            RpcValue::Double(number)
        }
        "dateTime.iso8601" => RpcValue::DateTime(read_text(reader, name)?.trim().to_string()),
        "base64" => RpcValue::Base64(read_text(reader, name)?.trim().to_string()),
        "nil" => {
            read_text(reader, name)?;
            RpcValue::Nil
        }
        "array" => parse_array(reader)?,
        "struct" => parse_struct(reader)?,
        other => return Err(protocol(format!("unsupported value type <{other}>"))),
    };
    Ok(value)
}

fn empty_typed(name: &str) -> Result<RpcValue, MirrorError> {
    match name {
        "string" => Ok(RpcValue::String(String::new())),
        "base64" => Ok(RpcValue::Base64(String::new())),
        "nil" => Ok(RpcValue::Nil),
        "array" => Ok(RpcValue::Array(Vec::new())),
        "struct" => Ok(RpcValue::Struct(Vec::new())),
        other => Err(protocol(format!("empty <{other}/> carries no value"))),
    }
}

fn read_text(reader: &mut Reader<&[u8]>, element: &str) -> Result<String, MirrorError> {
    let mut out = String::new();
    loop {
        match next_event(reader)? {
            Event::Text(text) => out.push_str(&unescape_text(&text)?),
            Event::CData(data) => out.push_str(&String::from_utf8_lossy(&data.into_inner())),
            Event::End(end) if end.name().as_ref() == element.as_bytes() => return Ok(out),
            Event::Start(nested) | Event::Empty(nested) => {
                return Err(protocol(format!(
                    "unexpected <{}> inside <{element}>",
                    tag_name(&nested)
                )));
            }
            Event::End(_) | Event::Eof => {
                return Err(protocol(format!("unterminated <{element}>")));
            }
            _ => {}
        }
    }
}

fn parse_array(reader: &mut Reader<&[u8]>) -> Result<RpcValue, MirrorError> {
    let mut items = Vec::new();
    loop {
        match next_event(reader)? {
            Event::Start(element) => match element.name().as_ref() {
                b"data" => {}
                b"value" => items.push(parse_value(reader)?),
                _ => return Err(protocol(format!("unexpected <{}> in <array>", tag_name(&element)))),
            },
            Event::Empty(element) => match element.name().as_ref() {
                b"data" => {}
                b"value" => items.push(RpcValue::String(String::new())),
                _ => return Err(protocol(format!("unexpected <{}/> in <array>", tag_name(&element)))),
            },
            Event::End(element) if element.name().as_ref() == b"array" => {
                return Ok(RpcValue::Array(items));
            }
            Event::Eof => return Err(protocol("unterminated <array>")),
            _ => {}
        }
    }
}

fn parse_struct(reader: &mut Reader<&[u8]>) -> Result<RpcValue, MirrorError> {
    let mut members = Vec::new();
    loop {
        match next_event(reader)? {
            Event::Start(element) if element.name().as_ref() == b"member" => {
                members.push(parse_member(reader)?);
            }
            Event::Start(element) | Event::Empty(element) => {
                return Err(protocol(format!(
                    "unexpected <{}> in <struct>",
                    tag_name(&element)
                )));
            }
            Event::End(element) if element.name().as_ref() == b"struct" => {
                return Ok(RpcValue::Struct(members));
            }
            Event::Eof => return Err(protocol("unterminated <struct>")),
            _ => {}
        }
    }
}

fn parse_member(reader: &mut Reader<&[u8]>) -> Result<(String, RpcValue), MirrorError> {
    let mut name = None;
    let mut value = None;
    loop {
        match next_event(reader)? {
            Event::Start(element) => match element.name().as_ref() {
                b"name" => name = Some(read_text(reader, "name")?),
                b"value" => value = Some(parse_value(reader)?),
                _ => return Err(protocol(format!("unexpected <{}> in <member>", tag_name(&element)))),
            },
            Event::Empty(element) if element.name().as_ref() == b"value" => {
                value = Some(RpcValue::String(String::new()));
            }
            Event::End(element) if element.name().as_ref() == b"member" => {
                return match (name, value) {
                    (Some(name), Some(value)) => Ok((name, value)),
                    _ => Err(protocol("<member> without <name> and <value>")),
                };
            }
            Event::Eof => return Err(protocol("unterminated <member>")),
            _ => {}
        }
    }
}
