// =========================
// message.rs
// フレーム ⇔ 型付きイベント・応答の変換
//
// 【このファイルで使う主なクレート】
// - std: バイト列操作、文字列変換（from_utf8_lossy）、IPアドレス（IpAddr）
// - crate::frame: Frame
// - crate::command: Command/ReplyCode/MacroStage
// - crate::action: Action/ModifyAction
// - crate::negotiate: OptNeg
//
// 【役割】
// - Event: MTA → フィルタ方向の各コマンドの符号化・復号化
// - Reply: フィルタ → MTA方向の応答・変更アクションの符号化・復号化
// - NUL終端文字列・ビッグエンディアン整数・アドレスファミリのペイロード分解
// - ペイロード長がコマンドの形式と一致しない場合はMalformedPayload
// =========================

use std::net::IpAddr;

use crate::action::{Action, ModifyAction};
use crate::command::{Command, MacroStage, ReplyCode};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::negotiate::OptNeg;

/// 接続元のアドレスファミリ（SMFIC_CONNECTの1バイトタグ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Unknown, // 'U'
    Unix,    // 'L'
    Inet,    // '4'
    Inet6,   // '6'
}

impl AddressFamily {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            b'U' => Some(AddressFamily::Unknown),
            b'L' => Some(AddressFamily::Unix),
            b'4' => Some(AddressFamily::Inet),
            b'6' => Some(AddressFamily::Inet6),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            AddressFamily::Unknown => b'U',
            AddressFamily::Unix => b'L',
            AddressFamily::Inet => b'4',
            AddressFamily::Inet6 => b'6',
        }
    }
}

/// SMFIC_CONNECTの内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    pub hostname: String,
    pub family: AddressFamily,
    /// Unknown/Unixでは0
    pub port: u16,
    /// IPv4ドット表記、IPv6表記、Unixソケットパス、Unknownでは空
    pub address: String,
}

impl ConnectInfo {
    /// IPアドレスとして解釈（Sendmailの"IPv6:"接頭辞も許容）
    pub fn ip(&self) -> Option<IpAddr> {
        match self.family {
            AddressFamily::Inet | AddressFamily::Inet6 => {
                let raw = self.address.strip_prefix("IPv6:").unwrap_or(&self.address);
                raw.parse().ok()
            }
            _ => None,
        }
    }
}

/// MTA → フィルタ方向のイベント
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    OptNeg(OptNeg),
    Macro {
        stage: MacroStage,
        macros: Vec<(String, String)>,
    },
    Connect(ConnectInfo),
    Helo(String),
    Mail {
        sender: String,
        args: Vec<String>,
    },
    Rcpt {
        recipient: String,
        args: Vec<String>,
    },
    Data,
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders,
    BodyChunk(Vec<u8>),
    EndOfBody,
    Unknown(String),
    Abort,
    Quit,
}

impl Event {
    /// 対応するコマンド
    pub fn command(&self) -> Command {
        match self {
            Event::OptNeg(_) => Command::OptNeg,
            Event::Macro { .. } => Command::Macro,
            Event::Connect(_) => Command::Connect,
            Event::Helo(_) => Command::Helo,
            Event::Mail { .. } => Command::Mail,
            Event::Rcpt { .. } => Command::Rcpt,
            Event::Data => Command::Data,
            Event::Header { .. } => Command::Header,
            Event::EndOfHeaders => Command::EndOfHeaders,
            Event::BodyChunk(_) => Command::Body,
            Event::EndOfBody => Command::EndOfBody,
            Event::Unknown(_) => Command::Unknown,
            Event::Abort => Command::Abort,
            Event::Quit => Command::Quit,
        }
    }

    /// フレームへ符号化
    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::new();
        match self {
            Event::OptNeg(neg) => payload = neg.encode(),
            Event::Macro { stage, macros } => {
                payload.push(stage.as_u8());
                for (name, value) in macros {
                    put_cstr(&mut payload, name);
                    put_cstr(&mut payload, value);
                }
            }
            Event::Connect(info) => {
                put_cstr(&mut payload, &info.hostname);
                payload.push(info.family.as_u8());
                if info.family != AddressFamily::Unknown {
                    payload.extend_from_slice(&info.port.to_be_bytes()); // ポート（2バイト）
                    put_cstr(&mut payload, &info.address);
                }
            }
            Event::Helo(name) => put_cstr(&mut payload, name),
            Event::Mail { sender: addr, args } | Event::Rcpt { recipient: addr, args } => {
                put_cstr(&mut payload, addr);
                for arg in args {
                    put_cstr(&mut payload, arg);
                }
            }
            Event::Header { name, value } => {
                put_cstr(&mut payload, name);
                put_cstr(&mut payload, value);
            }
            Event::BodyChunk(chunk) => payload.extend_from_slice(chunk),
            Event::Unknown(cmd) => put_cstr(&mut payload, cmd),
            Event::Data | Event::EndOfHeaders | Event::EndOfBody | Event::Abort | Event::Quit => {}
        }
        Frame::new(self.command().as_u8(), payload)
    }

    /// フレームから復号化
    pub fn from_frame(frame: &Frame) -> Result<Event> {
        let command = Command::from_u8(frame.command).ok_or_else(|| {
            Error::Protocol(format!("unknown command byte 0x{:02X}", frame.command))
        })?;
        let mut r = PayloadReader::new(frame.command, &frame.payload);
        let event = match command {
            Command::OptNeg => return Ok(Event::OptNeg(OptNeg::decode(frame.command, &frame.payload)?)),
            Command::Macro => {
                let code = r.u8()?;
                let stage = MacroStage::from_u8(code).ok_or_else(|| {
                    Error::malformed(frame.command, format!("unknown macro stage 0x{:02X}", code))
                })?;
                let mut macros = Vec::new();
                while !r.is_empty() {
                    let name = r.cstr()?;
                    let value = r
                        .cstr()
                        .map_err(|_| Error::malformed(frame.command, format!("macro {} has no value", name)))?;
                    macros.push((name, value));
                }
                Event::Macro { stage, macros }
            }
            Command::Connect => {
                let hostname = r.cstr()?;
                let tag = r.u8()?;
                let family = AddressFamily::from_u8(tag).ok_or_else(|| {
                    Error::malformed(frame.command, format!("unknown address family 0x{:02X}", tag))
                })?;
                let (port, address) = if family == AddressFamily::Unknown {
                    (0, String::new())
                } else {
                    (r.u16()?, r.cstr()?)
                };
                Event::Connect(ConnectInfo {
                    hostname,
                    family,
                    port,
                    address,
                })
            }
            Command::Helo => Event::Helo(r.cstr()?),
            Command::Mail | Command::Rcpt => {
                let addr = r.cstr()?;
                let mut args = Vec::new();
                while !r.is_empty() {
                    args.push(r.cstr()?);
                }
                if command == Command::Mail {
                    Event::Mail { sender: addr, args }
                } else {
                    Event::Rcpt {
                        recipient: addr,
                        args,
                    }
                }
            }
            Command::Header => Event::Header {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            Command::Body => return Ok(Event::BodyChunk(frame.payload.clone())),
            Command::Unknown => Event::Unknown(r.cstr()?),
            Command::Data => Event::Data,
            Command::EndOfHeaders => Event::EndOfHeaders,
            Command::EndOfBody => Event::EndOfBody,
            Command::Abort => Event::Abort,
            Command::Quit => Event::Quit,
        };
        r.finish()?;
        Ok(event)
    }
}

/// フィルタ → MTA方向の応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    OptNeg(OptNeg),
    Action(Action),
    Modify(ModifyAction),
    /// 処理中の通知（本文終了時のタイムアウト延長）
    Progress,
}

impl Reply {
    pub fn code(&self) -> ReplyCode {
        match self {
            Reply::OptNeg(_) => ReplyCode::OptNeg,
            Reply::Action(action) => action.reply_code(),
            Reply::Modify(modify) => modify.reply_code(),
            Reply::Progress => ReplyCode::Progress,
        }
    }

    /// フレームへ符号化
    pub fn to_frame(&self) -> Frame {
        let mut payload = Vec::new();
        match self {
            Reply::OptNeg(neg) => payload = neg.encode(),
            Reply::Action(Action::Quarantine(reason)) => put_cstr(&mut payload, reason),
            Reply::Action(Action::ReplyCode { code, text }) => {
                put_cstr(&mut payload, &format!("{} {}", code, text));
            }
            Reply::Action(_) | Reply::Progress => {}
            Reply::Modify(modify) => match modify {
                ModifyAction::AddHeader { name, value } => {
                    put_cstr(&mut payload, name);
                    put_cstr(&mut payload, value);
                }
                ModifyAction::InsertHeader { index, name, value }
                | ModifyAction::ChangeHeader { index, name, value } => {
                    payload.extend_from_slice(&index.to_be_bytes()); // ヘッダ位置（4バイト）
                    put_cstr(&mut payload, name);
                    put_cstr(&mut payload, value);
                }
                ModifyAction::AddRecipient { recipient, args } => {
                    put_cstr(&mut payload, recipient);
                    if let Some(args) = args {
                        put_cstr(&mut payload, args);
                    }
                }
                ModifyAction::DeleteRecipient { recipient } => put_cstr(&mut payload, recipient),
                ModifyAction::ChangeFrom { from, args } => {
                    put_cstr(&mut payload, from);
                    if let Some(args) = args {
                        put_cstr(&mut payload, args);
                    }
                }
                ModifyAction::ReplaceBody { chunk } => payload.extend_from_slice(chunk),
            },
        }
        Frame::new(self.code().as_u8(), payload)
    }

    /// フレームから復号化
    pub fn from_frame(frame: &Frame) -> Result<Reply> {
        let code = ReplyCode::from_u8(frame.command).ok_or_else(|| {
            Error::Protocol(format!("unknown reply byte 0x{:02X}", frame.command))
        })?;
        let mut r = PayloadReader::new(frame.command, &frame.payload);
        let reply = match code {
            ReplyCode::OptNeg => return Ok(Reply::OptNeg(OptNeg::decode(frame.command, &frame.payload)?)),
            ReplyCode::ReplaceBody => {
                return Ok(Reply::Modify(ModifyAction::ReplaceBody {
                    chunk: frame.payload.clone(),
                }))
            }
            ReplyCode::Continue => Reply::Action(Action::Continue),
            ReplyCode::Accept => Reply::Action(Action::Accept),
            ReplyCode::Reject => Reply::Action(Action::Reject),
            ReplyCode::Discard => Reply::Action(Action::Discard),
            ReplyCode::Tempfail => Reply::Action(Action::Tempfail),
            ReplyCode::Skip => Reply::Action(Action::Skip),
            ReplyCode::Progress => Reply::Progress,
            ReplyCode::Quarantine => Reply::Action(Action::Quarantine(r.cstr()?)),
            ReplyCode::ReplyCode => {
                let line = r.cstr()?;
                Reply::Action(parse_reply_line(frame.command, &line)?)
            }
            ReplyCode::AddHeader => Reply::Modify(ModifyAction::AddHeader {
                name: r.cstr()?,
                value: r.cstr()?,
            }),
            ReplyCode::InsertHeader => Reply::Modify(ModifyAction::InsertHeader {
                index: r.u32()?,
                name: r.cstr()?,
                value: r.cstr()?,
            }),
            ReplyCode::ChangeHeader => Reply::Modify(ModifyAction::ChangeHeader {
                index: r.u32()?,
                name: r.cstr()?,
                value: r.cstr()?,
            }),
            ReplyCode::AddRcpt => Reply::Modify(ModifyAction::AddRecipient {
                recipient: r.cstr()?,
                args: None,
            }),
            ReplyCode::AddRcptPar => Reply::Modify(ModifyAction::AddRecipient {
                recipient: r.cstr()?,
                args: Some(r.cstr()?),
            }),
            ReplyCode::DelRcpt => Reply::Modify(ModifyAction::DeleteRecipient {
                recipient: r.cstr()?,
            }),
            ReplyCode::ChangeFrom => {
                let from = r.cstr()?;
                let args = if r.is_empty() { None } else { Some(r.cstr()?) };
                Reply::Modify(ModifyAction::ChangeFrom { from, args })
            }
        };
        r.finish()?;
        Ok(reply)
    }
}

// "550 5.7.1 text" 形式の応答行を分解
fn parse_reply_line(command: u8, line: &str) -> Result<Action> {
    let digits = line.get(..3).unwrap_or("");
    let code: u16 = match digits.parse() {
        Ok(code) if digits.bytes().all(|b| b.is_ascii_digit()) => code,
        _ => return Err(Error::malformed(command, format!("bad reply code in {:?}", line))),
    };
    let text = line[3..].strip_prefix(' ').unwrap_or(&line[3..]).to_string();
    Action::with_reply(code, text)
        .ok_or_else(|| Error::malformed(command, format!("reply code {} is not 4xx/5xx", code)))
}

// NUL終端文字列を追加
fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// ペイロードの逐次読み取り（不足・余剰はMalformedPayload）
struct PayloadReader<'a> {
    command: u8,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(command: u8, buf: &'a [u8]) -> Self {
        PayloadReader {
            command,
            buf,
            pos: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::malformed(
                self.command,
                format!("payload truncated at byte {} (need {} more)", self.pos, n),
            ));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    // NUL終端文字列（ヘッダ等の8bit値はlossyに変換）
    fn cstr(&mut self) -> Result<String> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                let s = String::from_utf8_lossy(&rest[..end]).into_owned();
                self.pos += end + 1;
                Ok(s)
            }
            None => Err(Error::malformed(
                self.command,
                format!("missing NUL terminator at byte {}", self.pos),
            )),
        }
    }

    fn finish(&self) -> Result<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(Error::malformed(
                self.command,
                format!("{} unexpected trailing bytes", self.buf.len() - self.pos),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ActionFlags, ProtocolFlags};

    fn round_trip_event(event: Event) {
        let frame = event.to_frame();
        let decoded = Frame::decode(&frame.encode(), usize::MAX - 1).unwrap().unwrap().0;
        assert_eq!(Event::from_frame(&decoded).unwrap(), event);
    }

    fn round_trip_reply(reply: Reply) {
        let frame = reply.to_frame();
        assert_eq!(Reply::from_frame(&frame).unwrap(), reply);
    }

    #[test]
    fn connect_payload_layout_for_inet() {
        let event = Event::Connect(ConnectInfo {
            hostname: "host".into(),
            family: AddressFamily::Inet,
            port: 25565,
            address: "172.0.0.1".into(),
        });
        let frame = event.to_frame();
        assert_eq!(frame.command, b'C');
        let mut expected = b"host\04".to_vec();
        expected.extend_from_slice(&25565u16.to_be_bytes());
        expected.extend_from_slice(b"172.0.0.1\0");
        assert_eq!(frame.payload, expected);
        round_trip_event(event);
    }

    #[test]
    fn connect_unknown_family_has_no_port_or_address() {
        let event = Event::Connect(ConnectInfo {
            hostname: "localhost".into(),
            family: AddressFamily::Unknown,
            port: 0,
            address: String::new(),
        });
        assert_eq!(event.to_frame().payload, b"localhost\0U".to_vec());
        round_trip_event(event);
    }

    #[test]
    fn connect_rejects_bad_family_and_truncation() {
        let bad = Frame::new(b'C', b"host\0X".to_vec());
        assert!(matches!(Event::from_frame(&bad), Err(Error::MalformedPayload { .. })));
        let short = Frame::new(b'C', b"host\04\x00".to_vec());
        assert!(matches!(Event::from_frame(&short), Err(Error::MalformedPayload { .. })));
    }

    #[test]
    fn connect_ip_parses_both_families() {
        let v6 = ConnectInfo {
            hostname: "h".into(),
            family: AddressFamily::Inet6,
            port: 25,
            address: "IPv6:::1".into(),
        };
        assert_eq!(v6.ip(), Some("::1".parse().unwrap()));
        let unix = ConnectInfo {
            hostname: "h".into(),
            family: AddressFamily::Unix,
            port: 0,
            address: "/run/mta.sock".into(),
        };
        assert_eq!(unix.ip(), None);
    }

    #[test]
    fn events_round_trip() {
        round_trip_event(Event::OptNeg(OptNeg::propose(
            ActionFlags::ADD_HEADERS,
            ProtocolFlags::NO_HELO,
        )));
        round_trip_event(Event::Macro {
            stage: MacroStage::Helo,
            macros: vec![("tls_version".into(), "very old".into()), ("{j}".into(), String::new())],
        });
        round_trip_event(Event::Macro {
            stage: MacroStage::EndOfBody,
            macros: vec![],
        });
        round_trip_event(Event::Helo("helo_host".into()));
        round_trip_event(Event::Mail {
            sender: "from@example.org".into(),
            args: vec!["A=B".into()],
        });
        round_trip_event(Event::Rcpt {
            recipient: "to1@example.org".into(),
            args: vec![],
        });
        round_trip_event(Event::Header {
            name: "Subject".into(),
            value: "".into(),
        });
        round_trip_event(Event::BodyChunk(vec![]));
        round_trip_event(Event::BodyChunk(vec![b'A'; 65535]));
        round_trip_event(Event::Unknown("XCLIENT foo".into()));
        for bare in [Event::Data, Event::EndOfHeaders, Event::EndOfBody, Event::Abort, Event::Quit] {
            round_trip_event(bare);
        }
    }

    #[test]
    fn bare_events_reject_payload() {
        let frame = Frame::new(b'N', b"junk".to_vec());
        assert!(matches!(Event::from_frame(&frame), Err(Error::MalformedPayload { .. })));
    }

    #[test]
    fn macro_name_without_value_is_malformed() {
        let frame = Frame::new(b'D', b"Hj\0".to_vec());
        assert!(matches!(Event::from_frame(&frame), Err(Error::MalformedPayload { .. })));
    }

    #[test]
    fn header_without_terminator_is_malformed() {
        let frame = Frame::new(b'L', b"From\0nobody".to_vec());
        assert!(matches!(Event::from_frame(&frame), Err(Error::MalformedPayload { .. })));
    }

    #[test]
    fn change_header_index_is_preserved_on_the_wire() {
        let reply = Reply::Modify(ModifyAction::ChangeHeader {
            index: 3,
            name: "Subject".into(),
            value: "***SPAM***".into(),
        });
        let frame = reply.to_frame();
        assert_eq!(frame.command, b'm');
        assert_eq!(&frame.payload[..4], &[0, 0, 0, 3]);
        assert_eq!(&frame.payload[4..], b"Subject\0***SPAM***\0");
        round_trip_reply(reply);
    }

    #[test]
    fn replies_round_trip() {
        for action in [
            Action::Continue,
            Action::Accept,
            Action::Reject,
            Action::Discard,
            Action::Tempfail,
            Action::Skip,
            Action::Quarantine("looks bad".into()),
            Action::ReplyCode {
                code: 451,
                text: "4.7.1 try later".into(),
            },
        ] {
            round_trip_reply(Reply::Action(action));
        }
        round_trip_reply(Reply::Progress);
        round_trip_reply(Reply::Modify(ModifyAction::AddHeader {
            name: "X-Bad".into(),
            value: "very".into(),
        }));
        round_trip_reply(Reply::Modify(ModifyAction::InsertHeader {
            index: 0,
            name: "X-First".into(),
            value: "1".into(),
        }));
        round_trip_reply(Reply::Modify(ModifyAction::AddRecipient {
            recipient: "<bcc@example.org>".into(),
            args: None,
        }));
        round_trip_reply(Reply::Modify(ModifyAction::AddRecipient {
            recipient: "<bcc@example.org>".into(),
            args: Some("NOTIFY=NEVER".into()),
        }));
        round_trip_reply(Reply::Modify(ModifyAction::DeleteRecipient {
            recipient: "<to1@example.org>".into(),
        }));
        round_trip_reply(Reply::Modify(ModifyAction::ChangeFrom {
            from: "<bounce@example.org>".into(),
            args: None,
        }));
        round_trip_reply(Reply::Modify(ModifyAction::ChangeFrom {
            from: "<bounce@example.org>".into(),
            args: Some("SIZE=100".into()),
        }));
        round_trip_reply(Reply::Modify(ModifyAction::ReplaceBody {
            chunk: b"new body\r\n".to_vec(),
        }));
        round_trip_reply(Reply::OptNeg(OptNeg::propose(
            ActionFlags::QUARANTINE,
            ProtocolFlags::empty(),
        )));
    }

    #[test]
    fn reply_code_line_is_validated() {
        let frame = Frame::new(b'y', b"250 fine\0".to_vec());
        assert!(matches!(Reply::from_frame(&frame), Err(Error::MalformedPayload { .. })));
        let frame = Frame::new(b'y', b"5x0 bad\0".to_vec());
        assert!(matches!(Reply::from_frame(&frame), Err(Error::MalformedPayload { .. })));
        let frame = Frame::new(b'y', b"550\0".to_vec());
        assert_eq!(
            Reply::from_frame(&frame).unwrap(),
            Reply::Action(Action::ReplyCode {
                code: 550,
                text: String::new()
            })
        );
    }

    #[test]
    fn unknown_command_bytes_are_protocol_errors() {
        assert!(matches!(
            Event::from_frame(&Frame::bare(b'z')),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            Reply::from_frame(&Frame::bare(b'Z')),
            Err(Error::Protocol(_))
        ));
    }
}
