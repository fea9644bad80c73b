//! The Flash command binding of a connection.
//!
//! The main flow of a session transports AMF0 invocations (`connect`, `createStream`,
//! `publish`, `play`, `onStatus`, ...), and every media stream transports typed media
//! messages `(type, time, payload)`.  [`FlashConnection`] owns the streams of one
//! NetConnection, builds outbound invocations and turns inbound ones into events; the AMF
//! encoding itself is delegated entirely to the `rml_amf0` crate.

mod errors;

pub use self::errors::FlashMessageError;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use rml_amf0::Amf0Value;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use tracing::{debug, trace};

/// Signature of the main command flow of a connection
pub const MAIN_FLOW_SIGNATURE: &[u8] = &[0x00, 0x54, 0x43, 0x04, 0x00];

/// Builds the signature of a media stream flow from its media id
pub fn stream_signature(media_id: u16) -> Vec<u8> {
    let mut signature = vec![0x00, 0x54, 0x43, 0x04];
    crate::messages::write_u64_7bit(&mut signature, media_id as u64).expect("writing to a vec");
    signature
}

/// Extracts the media id out of a stream flow signature
pub fn media_id_from_signature(signature: &[u8]) -> Option<u16> {
    if signature.len() < 5 || signature[..4] != [0x00, 0x54, 0x43, 0x04] || signature[4] == 0 {
        return None;
    }

    let mut cursor = Cursor::new(&signature[4..]);
    crate::messages::read_u64_7bit(&mut cursor)
        .ok()
        .map(|id| id as u16)
}

/// Message type ids, shared with the group fragmenter
pub const TYPE_AUDIO: u8 = 0x08;
pub const TYPE_VIDEO: u8 = 0x09;
pub const TYPE_DATA_AMF3: u8 = 0x0F;
pub const TYPE_INVOCATION_AMF3: u8 = 0x11;
pub const TYPE_INVOCATION: u8 = 0x14;

/// One message of the Flash layer: a type byte, a 32 bit time and an opaque payload
#[derive(Debug, PartialEq, Clone)]
pub struct FlashMessage {
    pub type_id: u8,
    pub time: u32,
    pub payload: Bytes,
}

impl FlashMessage {
    pub fn write(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.payload.len() + 5);
        bytes.push(self.type_id);
        bytes.extend_from_slice(&self.time.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn parse(bytes: &[u8]) -> Result<FlashMessage, FlashMessageError> {
        let mut cursor = Cursor::new(bytes);
        let type_id = cursor.read_u8()?;
        let time = cursor.read_u32::<BigEndian>()?;
        let position = cursor.position() as usize;

        Ok(FlashMessage {
            type_id,
            time,
            payload: Bytes::copy_from_slice(&bytes[position..]),
        })
    }
}

/// Events that can be raised while processing the command traffic of a connection
#[derive(Debug, PartialEq)]
pub enum FlashEvent {
    /// The server accepted our `connect` invocation
    ConnectionSucceeded,

    /// The server rejected our `connect` invocation
    ConnectionFailed { description: String },

    /// A `createStream` result arrived; the stream is bound to the media id we requested
    StreamCreated { media_id: u16, stream_id: u32 },

    /// An `onStatus` event arrived, either on the connection or on one of its streams
    StatusEvent { code: String, description: String },

    /// A media message arrived on one of the streams
    MediaReceived {
        media_id: u16,
        type_id: u8,
        time: u32,
        payload: Bytes,
    },

    /// An invocation nobody handles arrived; consumers may log or inspect it
    UnhandledInvocation {
        name: String,
        arguments: Vec<Amf0Value>,
    },
}

enum PendingCommand {
    Connect,
    CreateStream { media_id: u16 },
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum StreamKind {
    Publisher,
    Player,
}

/// One NetStream of the connection
pub struct FlashStream {
    pub media_id: u16,
    pub stream_id: Option<u32>,
    pub name: String,
    pub kind: StreamKind,
}

/// The Flash view of one NetConnection: the command dialogue on the main flow plus the set
/// of media streams hanging off it.
pub struct FlashConnection {
    streams: BTreeMap<u16, FlashStream>,
    pending: HashMap<u64, PendingCommand>,
    next_callback: u64,
}

impl FlashConnection {
    pub fn new() -> FlashConnection {
        FlashConnection {
            streams: BTreeMap::new(),
            pending: HashMap::new(),
            next_callback: 1,
        }
    }

    pub fn stream(&self, media_id: u16) -> Option<&FlashStream> {
        self.streams.get(&media_id)
    }

    /// Builds the `connect` invocation that opens the command dialogue
    pub fn connect_request(
        &mut self,
        app: &str,
        url: &str,
    ) -> Result<Vec<u8>, FlashMessageError> {
        let callback = self.allocate_callback(PendingCommand::Connect);

        let mut properties = HashMap::new();
        properties.insert("app".to_string(), Amf0Value::Utf8String(app.to_string()));
        properties.insert("tcUrl".to_string(), Amf0Value::Utf8String(url.to_string()));
        properties.insert(
            "flashVer".to_string(),
            Amf0Value::Utf8String("WIN 20,0,0,286".to_string()),
        );
        properties.insert("objectEncoding".to_string(), Amf0Value::Number(3.0));

        self.invocation("connect", callback, vec![Amf0Value::Object(properties)], 0)
    }

    /// Builds a `createStream` invocation whose result will be bound to `media_id`
    pub fn create_stream_request(&mut self, media_id: u16) -> Result<Vec<u8>, FlashMessageError> {
        let callback = self.allocate_callback(PendingCommand::CreateStream { media_id });
        self.invocation("createStream", callback, vec![Amf0Value::Null], 0)
    }

    /// Builds a `publish` invocation and registers the stream as a publisher
    pub fn publish_request(
        &mut self,
        media_id: u16,
        stream_name: &str,
    ) -> Result<Vec<u8>, FlashMessageError> {
        self.streams.insert(
            media_id,
            FlashStream {
                media_id,
                stream_id: self.streams.get(&media_id).and_then(|stream| stream.stream_id),
                name: stream_name.to_string(),
                kind: StreamKind::Publisher,
            },
        );

        self.invocation(
            "publish",
            0,
            vec![
                Amf0Value::Null,
                Amf0Value::Utf8String(stream_name.to_string()),
            ],
            0,
        )
    }

    /// Builds a `play` invocation and registers the stream as a player
    pub fn play_request(
        &mut self,
        media_id: u16,
        stream_name: &str,
    ) -> Result<Vec<u8>, FlashMessageError> {
        self.streams.insert(
            media_id,
            FlashStream {
                media_id,
                stream_id: self.streams.get(&media_id).and_then(|stream| stream.stream_id),
                name: stream_name.to_string(),
                kind: StreamKind::Player,
            },
        );

        self.invocation(
            "play",
            0,
            vec![
                Amf0Value::Null,
                Amf0Value::Utf8String(stream_name.to_string()),
            ],
            0,
        )
    }

    /// Builds a `closeStream` invocation and forgets the stream
    pub fn close_stream_request(&mut self, media_id: u16) -> Result<Vec<u8>, FlashMessageError> {
        self.streams.remove(&media_id);
        self.invocation("closeStream", 0, vec![Amf0Value::Null], 0)
    }

    /// Builds the bare AMF payload of an `onStatus` invocation, for callers that frame the
    /// message themselves (the group fragmenter carries type and time out of band)
    pub fn status_payload(code: &str, description: &str) -> Result<Vec<u8>, FlashMessageError> {
        let mut info = HashMap::new();
        info.insert("level".to_string(), Amf0Value::Utf8String("status".to_string()));
        info.insert("code".to_string(), Amf0Value::Utf8String(code.to_string()));
        info.insert(
            "description".to_string(),
            Amf0Value::Utf8String(description.to_string()),
        );

        let values = vec![
            Amf0Value::Utf8String("onStatus".to_string()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
            Amf0Value::Object(info),
        ];

        Ok(rml_amf0::serialize(&values)?)
    }

    /// Builds the bare AMF payload of an invocation with string arguments, the shape data
    /// function calls injected into a group stream use
    pub fn invocation_payload(
        name: &str,
        arguments: &[String],
    ) -> Result<Vec<u8>, FlashMessageError> {
        let mut values = vec![
            Amf0Value::Utf8String(name.to_string()),
            Amf0Value::Number(0.0),
            Amf0Value::Null,
        ];
        for argument in arguments {
            values.push(Amf0Value::Utf8String(argument.clone()));
        }

        Ok(rml_amf0::serialize(&values)?)
    }

    /// Processes one message received on the main command flow
    pub fn handle_command_message(
        &mut self,
        bytes: &[u8],
    ) -> Result<Vec<FlashEvent>, FlashMessageError> {
        let message = FlashMessage::parse(bytes)?;
        if message.type_id != TYPE_INVOCATION && message.type_id != TYPE_INVOCATION_AMF3 {
            trace!(type_id = message.type_id, "Ignoring non invocation on the command flow");
            return Ok(Vec::new());
        }

        let mut payload = message.payload.as_ref();
        // An AMF3 invocation is an AMF0 one behind a leading escape byte
        if message.type_id == TYPE_INVOCATION_AMF3 && !payload.is_empty() {
            payload = &payload[1..];
        }

        let mut cursor = Cursor::new(payload.to_vec());
        let mut values = rml_amf0::deserialize(&mut cursor)?.into_iter();

        let name = match values.next() {
            Some(Amf0Value::Utf8String(name)) => name,
            _ => return Err(FlashMessageError::MalformedInvocation),
        };
        let callback = match values.next() {
            Some(Amf0Value::Number(number)) => number as u64,
            _ => return Err(FlashMessageError::MalformedInvocation),
        };
        let arguments: Vec<Amf0Value> = values.collect();

        match name.as_str() {
            "_result" => self.handle_result(callback, arguments),
            "_error" => self.handle_error(arguments),
            "onStatus" => Ok(self.handle_on_status(arguments)),
            _ => Ok(vec![FlashEvent::UnhandledInvocation { name, arguments }]),
        }
    }

    /// Processes one message received on a media stream flow
    pub fn handle_media_message(
        &mut self,
        media_id: u16,
        bytes: &[u8],
    ) -> Result<Vec<FlashEvent>, FlashMessageError> {
        let message = FlashMessage::parse(bytes)?;

        match message.type_id {
            TYPE_AUDIO | TYPE_VIDEO | TYPE_DATA_AMF3 => Ok(vec![FlashEvent::MediaReceived {
                media_id,
                type_id: message.type_id,
                time: message.time,
                payload: message.payload,
            }]),
            TYPE_INVOCATION | TYPE_INVOCATION_AMF3 => {
                // Stream level statuses (unpublish notifications and friends)
                self.handle_command_message(bytes)
            }
            _ => {
                trace!(type_id = message.type_id, "Ignoring unknown media message type");
                Ok(Vec::new())
            }
        }
    }

    fn handle_result(
        &mut self,
        callback: u64,
        arguments: Vec<Amf0Value>,
    ) -> Result<Vec<FlashEvent>, FlashMessageError> {
        match self.pending.remove(&callback) {
            Some(PendingCommand::Connect) => {
                debug!("Connection request accepted");
                Ok(vec![FlashEvent::ConnectionSucceeded])
            }
            Some(PendingCommand::CreateStream { media_id }) => {
                let stream_id = arguments
                    .iter()
                    .rev()
                    .find_map(|value| match value {
                        Amf0Value::Number(number) => Some(*number as u32),
                        _ => None,
                    })
                    .unwrap_or(0);

                if let Some(stream) = self.streams.get_mut(&media_id) {
                    stream.stream_id = Some(stream_id);
                } else {
                    self.streams.insert(
                        media_id,
                        FlashStream {
                            media_id,
                            stream_id: Some(stream_id),
                            name: String::new(),
                            kind: StreamKind::Player,
                        },
                    );
                }

                Ok(vec![FlashEvent::StreamCreated {
                    media_id,
                    stream_id,
                }])
            }
            None => Err(FlashMessageError::UnknownCallback { callback }),
        }
    }

    fn handle_error(&mut self, arguments: Vec<Amf0Value>) -> Result<Vec<FlashEvent>, FlashMessageError> {
        let description = extract_info_field(&arguments, "description")
            .or_else(|| extract_info_field(&arguments, "code"))
            .unwrap_or_else(|| "Connection rejected".to_string());

        Ok(vec![FlashEvent::ConnectionFailed { description }])
    }

    fn handle_on_status(&mut self, arguments: Vec<Amf0Value>) -> Vec<FlashEvent> {
        let code = extract_info_field(&arguments, "code").unwrap_or_default();
        let description = extract_info_field(&arguments, "description").unwrap_or_default();

        match code.as_str() {
            "NetConnection.Connect.Success" => vec![FlashEvent::ConnectionSucceeded],
            "NetConnection.Connect.Failed" | "NetConnection.Connect.Rejected" => {
                vec![FlashEvent::ConnectionFailed { description }]
            }
            _ => vec![FlashEvent::StatusEvent { code, description }],
        }
    }

    fn invocation(
        &self,
        name: &str,
        callback: u64,
        mut arguments: Vec<Amf0Value>,
        time: u32,
    ) -> Result<Vec<u8>, FlashMessageError> {
        let mut values = vec![
            Amf0Value::Utf8String(name.to_string()),
            Amf0Value::Number(callback as f64),
        ];
        values.append(&mut arguments);

        let payload = rml_amf0::serialize(&values)?;
        Ok(FlashMessage {
            type_id: TYPE_INVOCATION,
            time,
            payload: Bytes::from(payload),
        }
        .write())
    }

    fn allocate_callback(&mut self, command: PendingCommand) -> u64 {
        let callback = self.next_callback;
        self.next_callback += 1;
        self.pending.insert(callback, command);
        callback
    }
}

fn extract_info_field(arguments: &[Amf0Value], field: &str) -> Option<String> {
    for value in arguments {
        if let Amf0Value::Object(properties) = value {
            if let Some(Amf0Value::Utf8String(text)) = properties.get(field) {
                return Some(text.clone());
            }
        }
    }

    None
}
