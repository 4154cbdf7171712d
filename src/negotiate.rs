// =========================
// negotiate.rs
// オプション交渉（SMFIC_OPTNEG）とセッションのケイパビリティ
//
// 【このファイルで使う主なクレート】
// - crate::flags: ActionFlags/ProtocolFlags
// - crate::error: バージョン不一致・過剰要求のProtocolエラー
// - crate::printdaytimeln!: 交渉結果のログ出力
//
// 【役割】
// - 要求側（MTA）: 最大バージョンと希望フラグを提案し、応答を検証
// - 応答側（フィルタ）: 提案との共通部分で応答（提案より多くは返さない）
// - 合意したCapabilitiesはセッション中不変
// =========================

use crate::command::Command;
use crate::error::{Error, Result};
use crate::flags::{ActionFlags, ProtocolFlags};

/// このクレートが話せる最大プロトコルバージョン
pub const PROTOCOL_VERSION: u32 = 6;

/// 受け付ける最小プロトコルバージョン
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// OPTNEGペイロード（バージョン + アクションフラグ + プロトコルフラグ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptNeg {
    pub version: u32,
    pub actions: ActionFlags,
    pub protocol: ProtocolFlags,
}

impl OptNeg {
    /// 12バイトのペイロードへ符号化
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.version.to_be_bytes()); // プロトコルバージョン（4バイト）
        buf.extend_from_slice(&self.actions.bits().to_be_bytes()); // アクションフラグ（4バイト）
        buf.extend_from_slice(&self.protocol.bits().to_be_bytes()); // プロトコルフラグ（4バイト）
        buf
    }

    /// ペイロードから復号化する
    /// 12バイト以降（v6のマクロ一覧拡張など）は無視する
    pub fn decode(command: u8, payload: &[u8]) -> Result<Self> {
        if payload.len() < 12 {
            return Err(Error::malformed(
                command,
                format!("option negotiation needs 12 bytes, got {}", payload.len()),
            ));
        }
        let word = |i: usize| {
            u32::from_be_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]])
        };
        Ok(OptNeg {
            version: word(0),
            actions: ActionFlags::from_bits_truncate(word(4)),
            protocol: ProtocolFlags::from_bits_truncate(word(8)),
        })
    }

    /// 要求側の提案を作る
    pub fn propose(actions: ActionFlags, protocol: ProtocolFlags) -> Self {
        OptNeg {
            version: PROTOCOL_VERSION,
            actions,
            protocol,
        }
    }

    /// 応答側: 提案に対する応答を決める
    ///
    /// # 引数
    /// - `offer`: MTAからの提案
    /// - `actions`: フィルタが使いたいアクション
    /// - `protocol`: フィルタが省略したいステップ
    ///
    /// # 説明
    /// バージョンは提案以下に下げ、フラグは提案との共通部分のみ返す。
    /// 提案バージョンが最小未満なら交渉失敗。
    pub fn respond(offer: &OptNeg, actions: ActionFlags, protocol: ProtocolFlags) -> Result<Self> {
        if offer.version < MIN_PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {} (need at least {})",
                offer.version, MIN_PROTOCOL_VERSION
            )));
        }
        Ok(OptNeg {
            version: offer.version.min(PROTOCOL_VERSION),
            actions: offer.actions & actions,
            protocol: offer.protocol & protocol,
        })
    }

    /// 要求側: 応答を検証して合意内容を確定する
    pub fn accept(proposal: &OptNeg, reply: &OptNeg) -> Result<Capabilities> {
        if reply.version > proposal.version || reply.version < MIN_PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "filter answered with protocol version {} (offered {})",
                reply.version, proposal.version
            )));
        }
        if !reply.actions.is_subset_of(proposal.actions) {
            return Err(Error::Protocol(format!(
                "filter requested actions beyond offer: {}",
                reply.actions
            )));
        }
        if !reply.protocol.is_subset_of(proposal.protocol) {
            return Err(Error::Protocol(format!(
                "filter requested protocol steps beyond offer: {}",
                reply.protocol
            )));
        }
        Ok(Capabilities {
            version: reply.version,
            actions: reply.actions,
            protocol: reply.protocol,
        })
    }
}

/// セッション全体で有効な合意済みケイパビリティ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub version: u32,
    pub actions: ActionFlags,
    pub protocol: ProtocolFlags,
}

impl Capabilities {
    /// アクションを使ってよいか確認する（書き込み前に呼ぶ）
    pub fn check_action(&self, required: ActionFlags) -> Result<()> {
        if self.actions.contains(required) {
            Ok(())
        } else {
            Err(Error::UnsupportedAction(required.to_string()))
        }
    }

    /// このコマンドが交渉で省略（NO_*）されているか
    pub fn skips(&self, command: Command) -> bool {
        match skip_flag(command) {
            Some(flag) => self.protocol.contains(flag),
            None => false,
        }
    }

    /// このコマンドが無応答（NO_REPLY_*）か
    pub fn no_reply(&self, command: Command) -> bool {
        match no_reply_flag(command) {
            Some(flag) => self.protocol.contains(flag),
            None => false,
        }
    }
}

/// コマンドに対応する省略フラグ
pub fn skip_flag(command: Command) -> Option<ProtocolFlags> {
    match command {
        Command::Connect => Some(ProtocolFlags::NO_CONNECT),
        Command::Helo => Some(ProtocolFlags::NO_HELO),
        Command::Mail => Some(ProtocolFlags::NO_MAIL),
        Command::Rcpt => Some(ProtocolFlags::NO_RCPT),
        Command::Data => Some(ProtocolFlags::NO_DATA),
        Command::Header => Some(ProtocolFlags::NO_HEADERS),
        Command::EndOfHeaders => Some(ProtocolFlags::NO_EOH),
        Command::Body => Some(ProtocolFlags::NO_BODY),
        Command::Unknown => Some(ProtocolFlags::NO_UNKNOWN),
        _ => None,
    }
}

/// コマンドに対応する無応答フラグ
pub fn no_reply_flag(command: Command) -> Option<ProtocolFlags> {
    match command {
        Command::Connect => Some(ProtocolFlags::NO_REPLY_CONNECT),
        Command::Helo => Some(ProtocolFlags::NO_REPLY_HELO),
        Command::Mail => Some(ProtocolFlags::NO_REPLY_MAIL),
        Command::Rcpt => Some(ProtocolFlags::NO_REPLY_RCPT),
        Command::Data => Some(ProtocolFlags::NO_REPLY_DATA),
        Command::Header => Some(ProtocolFlags::NO_REPLY_HEADER),
        Command::EndOfHeaders => Some(ProtocolFlags::NO_REPLY_EOH),
        Command::Body => Some(ProtocolFlags::NO_REPLY_BODY),
        Command::Unknown => Some(ProtocolFlags::NO_REPLY_UNKNOWN),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer() -> OptNeg {
        OptNeg::propose(
            ActionFlags::ADD_HEADERS | ActionFlags::CHANGE_HEADERS | ActionFlags::QUARANTINE,
            ProtocolFlags::NO_BODY | ProtocolFlags::SKIP,
        )
    }

    #[test]
    fn payload_layout_is_three_big_endian_words() {
        let neg = offer();
        let bytes = neg.encode();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &[0, 0, 0, 6]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0x31]);
        assert_eq!(&bytes[8..], &[0, 0, 0x04, 0x10]);
        assert_eq!(OptNeg::decode(b'O', &bytes).unwrap(), neg);
    }

    #[test]
    fn decode_tolerates_trailing_bytes_but_not_short_payload() {
        let mut bytes = offer().encode();
        bytes.extend_from_slice(b"\0\0\0\x01{j}\0");
        assert_eq!(OptNeg::decode(b'O', &bytes).unwrap(), offer());
        assert!(matches!(
            OptNeg::decode(b'O', &bytes[..11]),
            Err(Error::MalformedPayload { .. })
        ));
    }

    #[test]
    fn responder_never_grants_more_than_offered() {
        let reply = OptNeg::respond(
            &offer(),
            ActionFlags::ADD_HEADERS | ActionFlags::CHANGE_BODY,
            ProtocolFlags::NO_BODY | ProtocolFlags::NO_HELO,
        )
        .unwrap();
        assert_eq!(reply.version, 6);
        assert_eq!(reply.actions, ActionFlags::ADD_HEADERS);
        assert_eq!(reply.protocol, ProtocolFlags::NO_BODY);
        let caps = OptNeg::accept(&offer(), &reply).unwrap();
        assert_eq!(caps.actions, ActionFlags::ADD_HEADERS);
        assert!(caps.skips(Command::Body));
        assert!(!caps.skips(Command::Helo));
    }

    #[test]
    fn responder_lowers_version_and_rejects_ancient_peers() {
        let mut newer = offer();
        newer.version = 9;
        assert_eq!(
            OptNeg::respond(&newer, ActionFlags::all(), ProtocolFlags::empty())
                .unwrap()
                .version,
            6
        );
        let mut old = offer();
        old.version = 1;
        assert!(matches!(
            OptNeg::respond(&old, ActionFlags::all(), ProtocolFlags::empty()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn requester_rejects_overreaching_reply() {
        let mut reply = offer();
        reply.actions = reply.actions | ActionFlags::CHANGE_FROM;
        assert!(OptNeg::accept(&offer(), &reply).is_err());
        let mut reply = offer();
        reply.version = 7;
        assert!(OptNeg::accept(&offer(), &reply).is_err());
        let mut reply = offer();
        reply.protocol = ProtocolFlags::NO_CONNECT;
        assert!(OptNeg::accept(&offer(), &reply).is_err());
    }

    #[test]
    fn check_action_reports_missing_flag() {
        let caps = OptNeg::accept(&offer(), &offer()).unwrap();
        assert!(caps.check_action(ActionFlags::ADD_HEADERS).is_ok());
        match caps.check_action(ActionFlags::CHANGE_BODY) {
            Err(Error::UnsupportedAction(name)) => assert_eq!(name, "change_body"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn no_reply_flags_map_per_command() {
        let caps = Capabilities {
            version: 6,
            actions: ActionFlags::empty(),
            protocol: ProtocolFlags::NO_REPLY_HEADER | ProtocolFlags::NO_REPLY_RCPT,
        };
        assert!(caps.no_reply(Command::Header));
        assert!(caps.no_reply(Command::Rcpt));
        assert!(!caps.no_reply(Command::Mail));
        assert!(!caps.no_reply(Command::EndOfBody));
    }
}
