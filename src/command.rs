// =========================
// command.rs
// Milterプロトコルのコマンド種別・応答種別・マクロステージ定義
//
// 【このファイルで使う主なクレート】
// - std: 標準ライブラリ（列挙型・マッチ分岐・デバッグ用）
//
// 【役割】
// - Command: MTA → フィルタ方向のコマンド種別（SMFIC_*）
// - ReplyCode: フィルタ → MTA方向の応答種別（SMFIR_*）
// - MacroStage: マクロがどのステージに属するかを示す識別子
// - 各種変換・用途名取得メソッド
// =========================

/// MTA → フィルタ方向のコマンド（SMFIC_*）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Abort = b'A',        // SMFIC_ABORT: メッセージ処理中断
    Body = b'B',         // SMFIC_BODY: 本文チャンク
    Connect = b'C',      // SMFIC_CONNECT: 接続情報
    Macro = b'D',        // SMFIC_MACRO: マクロ定義
    EndOfBody = b'E',    // SMFIC_BODYEOB: 本文終了
    Helo = b'H',         // SMFIC_HELO: HELO/EHLO
    Header = b'L',       // SMFIC_HEADER: ヘッダ1行
    Mail = b'M',         // SMFIC_MAIL: MAIL FROM
    EndOfHeaders = b'N', // SMFIC_EOH: ヘッダ終了
    OptNeg = b'O',       // SMFIC_OPTNEG: オプション交渉
    Quit = b'Q',         // SMFIC_QUIT: セッション終了
    Rcpt = b'R',         // SMFIC_RCPT: RCPT TO
    Data = b'T',         // SMFIC_DATA: DATAコマンド
    Unknown = b'U',      // SMFIC_UNKNOWN: 未知のSMTPコマンド
}

impl Command {
    /// 1バイト値からCommandへ変換
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            b'A' => Some(Command::Abort),
            b'B' => Some(Command::Body),
            b'C' => Some(Command::Connect),
            b'D' => Some(Command::Macro),
            b'E' => Some(Command::EndOfBody),
            b'H' => Some(Command::Helo),
            b'L' => Some(Command::Header),
            b'M' => Some(Command::Mail),
            b'N' => Some(Command::EndOfHeaders),
            b'O' => Some(Command::OptNeg),
            b'Q' => Some(Command::Quit),
            b'R' => Some(Command::Rcpt),
            b'T' => Some(Command::Data),
            b'U' => Some(Command::Unknown),
            _ => None,
        }
    }

    /// ワイヤ上のバイト値
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// ログ用のコマンド名
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Abort => "SMFIC_ABORT",
            Command::Body => "SMFIC_BODY",
            Command::Connect => "SMFIC_CONNECT",
            Command::Macro => "SMFIC_MACRO",
            Command::EndOfBody => "SMFIC_BODYEOB",
            Command::Helo => "SMFIC_HELO",
            Command::Header => "SMFIC_HEADER",
            Command::Mail => "SMFIC_MAIL",
            Command::EndOfHeaders => "SMFIC_EOH",
            Command::OptNeg => "SMFIC_OPTNEG",
            Command::Quit => "SMFIC_QUIT",
            Command::Rcpt => "SMFIC_RCPT",
            Command::Data => "SMFIC_DATA",
            Command::Unknown => "SMFIC_UNKNOWN",
        }
    }
}

/// フィルタ → MTA方向の応答（SMFIR_*）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyCode {
    AddRcpt = b'+',      // SMFIR_ADDRCPT: 宛先追加
    DelRcpt = b'-',      // SMFIR_DELRCPT: 宛先削除
    AddRcptPar = b'2',   // SMFIR_ADDRCPT_PAR: ESMTP引数付き宛先追加
    Accept = b'a',       // SMFIR_ACCEPT
    ReplaceBody = b'b',  // SMFIR_REPLBODY: 本文置換
    Continue = b'c',     // SMFIR_CONTINUE
    Discard = b'd',      // SMFIR_DISCARD
    ChangeFrom = b'e',   // SMFIR_CHGFROM: 送信者変更
    AddHeader = b'h',    // SMFIR_ADDHEADER
    InsertHeader = b'i', // SMFIR_INSHEADER
    ChangeHeader = b'm', // SMFIR_CHGHEADER
    Progress = b'p',     // SMFIR_PROGRESS
    Quarantine = b'q',   // SMFIR_QUARANTINE
    Reject = b'r',       // SMFIR_REJECT
    Skip = b's',         // SMFIR_SKIP: 残りの本文チャンクを不要とする
    Tempfail = b't',     // SMFIR_TEMPFAIL
    ReplyCode = b'y',    // SMFIR_REPLYCODE: SMTP応答コード指定
    OptNeg = b'O',       // SMFIC_OPTNEG応答
}

impl ReplyCode {
    /// 1バイト値からReplyCodeへ変換
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            b'+' => Some(ReplyCode::AddRcpt),
            b'-' => Some(ReplyCode::DelRcpt),
            b'2' => Some(ReplyCode::AddRcptPar),
            b'a' => Some(ReplyCode::Accept),
            b'b' => Some(ReplyCode::ReplaceBody),
            b'c' => Some(ReplyCode::Continue),
            b'd' => Some(ReplyCode::Discard),
            b'e' => Some(ReplyCode::ChangeFrom),
            b'h' => Some(ReplyCode::AddHeader),
            b'i' => Some(ReplyCode::InsertHeader),
            b'm' => Some(ReplyCode::ChangeHeader),
            b'p' => Some(ReplyCode::Progress),
            b'q' => Some(ReplyCode::Quarantine),
            b'r' => Some(ReplyCode::Reject),
            b's' => Some(ReplyCode::Skip),
            b't' => Some(ReplyCode::Tempfail),
            b'y' => Some(ReplyCode::ReplyCode),
            b'O' => Some(ReplyCode::OptNeg),
            _ => None,
        }
    }

    /// ワイヤ上のバイト値
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// ログ用の応答名
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyCode::AddRcpt => "SMFIR_ADDRCPT",
            ReplyCode::DelRcpt => "SMFIR_DELRCPT",
            ReplyCode::AddRcptPar => "SMFIR_ADDRCPT_PAR",
            ReplyCode::Accept => "SMFIR_ACCEPT",
            ReplyCode::ReplaceBody => "SMFIR_REPLBODY",
            ReplyCode::Continue => "SMFIR_CONTINUE",
            ReplyCode::Discard => "SMFIR_DISCARD",
            ReplyCode::ChangeFrom => "SMFIR_CHGFROM",
            ReplyCode::AddHeader => "SMFIR_ADDHEADER",
            ReplyCode::InsertHeader => "SMFIR_INSHEADER",
            ReplyCode::ChangeHeader => "SMFIR_CHGHEADER",
            ReplyCode::Progress => "SMFIR_PROGRESS",
            ReplyCode::Quarantine => "SMFIR_QUARANTINE",
            ReplyCode::Reject => "SMFIR_REJECT",
            ReplyCode::Skip => "SMFIR_SKIP",
            ReplyCode::Tempfail => "SMFIR_TEMPFAIL",
            ReplyCode::ReplyCode => "SMFIR_REPLYCODE",
            ReplyCode::OptNeg => "SMFIR_OPTNEG",
        }
    }
}

/// マクロの適用ステージ（SMFIC_MACROペイロードの先頭バイト）
/// 例: HELO前に送られたマクロはHeloステージに属する
/// 順序はワイヤのバイト値ではなくSMTPの進行順（rank()）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MacroStage {
    Connect = b'C',
    Helo = b'H',
    Mail = b'M',
    Rcpt = b'R',
    Data = b'T',
    Header = b'L',
    EndOfHeaders = b'N',
    Body = b'B',
    EndOfBody = b'E',
    Unknown = b'U',
}

impl MacroStage {
    /// 1バイト値からMacroStageへ変換
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            b'C' => Some(MacroStage::Connect),
            b'H' => Some(MacroStage::Helo),
            b'M' => Some(MacroStage::Mail),
            b'R' => Some(MacroStage::Rcpt),
            b'T' => Some(MacroStage::Data),
            b'L' => Some(MacroStage::Header),
            b'N' => Some(MacroStage::EndOfHeaders),
            b'B' => Some(MacroStage::Body),
            b'E' => Some(MacroStage::EndOfBody),
            b'U' => Some(MacroStage::Unknown),
            _ => None,
        }
    }

    /// ワイヤ上のバイト値
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// SMTPの進行順での位置
    /// Unknownはどの時点でも届くので最も前に置く（他ステージの値が優先される）
    pub fn rank(self) -> u8 {
        match self {
            MacroStage::Unknown => 0,
            MacroStage::Connect => 1,
            MacroStage::Helo => 2,
            MacroStage::Mail => 3,
            MacroStage::Rcpt => 4,
            MacroStage::Data => 5,
            MacroStage::Header => 6,
            MacroStage::EndOfHeaders => 7,
            MacroStage::Body => 8,
            MacroStage::EndOfBody => 9,
        }
    }

    /// メッセージ単位（MAIL FROM以降）のマクロかどうか
    /// Abort・本文終了時にクリアする対象
    pub fn is_message_scoped(self) -> bool {
        !matches!(self, MacroStage::Connect | MacroStage::Helo | MacroStage::Unknown)
    }

    /// ログ用の名前
    pub fn as_str(&self) -> &'static str {
        match self {
            MacroStage::Connect => "MACRO_Connect",
            MacroStage::Helo => "MACRO_Helo",
            MacroStage::Mail => "MACRO_Mail",
            MacroStage::Rcpt => "MACRO_Rcpt",
            MacroStage::Data => "MACRO_Data",
            MacroStage::Header => "MACRO_Header",
            MacroStage::EndOfHeaders => "MACRO_Eoh",
            MacroStage::Body => "MACRO_Body",
            MacroStage::EndOfBody => "MACRO_Eob",
            MacroStage::Unknown => "MACRO_Unknown",
        }
    }
}

impl PartialOrd for MacroStage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MacroStage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bytes_are_stable() {
        for b in 0u8..=255 {
            if let Some(cmd) = Command::from_u8(b) {
                assert_eq!(cmd.as_u8(), b);
            }
        }
        assert_eq!(Command::from_u8(b'N'), Some(Command::EndOfHeaders));
        assert_eq!(Command::from_u8(b'E'), Some(Command::EndOfBody));
        assert_eq!(Command::from_u8(b'x'), None);
    }

    #[test]
    fn reply_bytes_are_stable() {
        for b in 0u8..=255 {
            if let Some(code) = ReplyCode::from_u8(b) {
                assert_eq!(code.as_u8(), b);
            }
        }
        assert_eq!(ReplyCode::from_u8(b'm'), Some(ReplyCode::ChangeHeader));
        assert_eq!(ReplyCode::from_u8(b'q'), Some(ReplyCode::Quarantine));
    }

    #[test]
    fn macro_stage_scope() {
        assert!(!MacroStage::Connect.is_message_scoped());
        assert!(!MacroStage::Helo.is_message_scoped());
        assert!(MacroStage::Mail.is_message_scoped());
        assert!(MacroStage::EndOfBody.is_message_scoped());
        assert_eq!(MacroStage::from_u8(b'H'), Some(MacroStage::Helo));
    }

    #[test]
    fn macro_stages_sort_in_smtp_order() {
        let mut stages = vec![
            MacroStage::EndOfBody,
            MacroStage::Unknown,
            MacroStage::Mail,
            MacroStage::Body,
            MacroStage::Connect,
            MacroStage::EndOfHeaders,
            MacroStage::Helo,
            MacroStage::Header,
            MacroStage::Rcpt,
            MacroStage::Data,
        ];
        stages.sort();
        assert_eq!(
            stages,
            vec![
                MacroStage::Unknown,
                MacroStage::Connect,
                MacroStage::Helo,
                MacroStage::Mail,
                MacroStage::Rcpt,
                MacroStage::Data,
                MacroStage::Header,
                MacroStage::EndOfHeaders,
                MacroStage::Body,
                MacroStage::EndOfBody,
            ]
        );
    }
}
