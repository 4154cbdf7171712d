// =========================
// stage.rs
// SMTPトランザクションのステージ順序（MTA側・フィルタ側で共用）
//
// 【このファイルで使う主なクレート】
// - crate::command: Command（ステージに対応するコマンド）
// - crate::flags: ProtocolFlags（交渉で省略されたステップは通過済みとみなす）
// - crate::error: 順序違反のProtocolエラー
//
// 【役割】
// - Connect → Helo → Mail → Rcpt* → (Data) → Header* → EndOfHeaders → BodyChunk* → EndOfBody
// - 必須ステップの飛ばし検出、繰り返し可能ステップの判定
// - 本文終了・Abort後は次のメッセージ（Mail）を受け付ける位置へ戻る
// =========================

use crate::command::Command;
use crate::error::{Error, Result};
use crate::flags::ProtocolFlags;
use crate::negotiate::skip_flag;

// 順序付きステップ一覧: (コマンド, 必須か, 繰り返し可能か)
const ORDER: [(Command, bool, bool); 9] = [
    (Command::Connect, true, false),
    (Command::Helo, true, true),
    (Command::Mail, true, false),
    (Command::Rcpt, false, true),
    (Command::Data, false, false),
    (Command::Header, false, true),
    (Command::EndOfHeaders, true, false),
    (Command::Body, false, true),
    (Command::EndOfBody, true, false),
];

const HELO_POS: usize = 1;
const MAIL_POS: usize = 2;

fn position(command: Command) -> Option<usize> {
    ORDER.iter().position(|(c, _, _)| *c == command)
}

/// 1接続分のステージ位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTracker {
    // 最後に通過したステップの位置（Noneは交渉直後）
    current: Option<usize>,
    skipped: ProtocolFlags,
}

impl StageTracker {
    /// 交渉直後の状態。`skipped`は合意済みプロトコルフラグ
    pub fn new(skipped: ProtocolFlags) -> Self {
        StageTracker {
            current: None,
            skipped,
        }
    }

    /// 最後に通過したステップ
    pub fn current(&self) -> Option<Command> {
        self.current.map(|pos| ORDER[pos].0)
    }

    fn is_skipped(&self, command: Command) -> bool {
        skip_flag(command).is_some_and(|flag| self.skipped.contains(flag))
    }

    // 変更せずに遷移先を計算する
    fn target(&self, command: Command) -> Result<usize> {
        let target = position(command).ok_or_else(|| {
            Error::Protocol(format!("{} is not an ordered stage", command.as_str()))
        })?;
        if let Some(cur) = self.current {
            if target == cur && ORDER[cur].2 {
                return Ok(target); // 繰り返し可能（Rcpt, Header, Body等）
            }
            if target <= cur {
                return Err(self.out_of_order(command));
            }
        }
        let start = self.current.map_or(0, |cur| cur + 1);
        for &(between, mandatory, _) in &ORDER[start..target] {
            if mandatory && !self.is_skipped(between) {
                return Err(Error::Protocol(format!(
                    "{} received before {}",
                    command.as_str(),
                    between.as_str()
                )));
            }
        }
        Ok(target)
    }

    fn out_of_order(&self, command: Command) -> Error {
        Error::Protocol(format!(
            "{} out of order after {}",
            command.as_str(),
            self.current().map_or("option negotiation", |c| c.as_str())
        ))
    }

    /// このコマンドが今受け付けられるか確認して状態を進める
    /// 本文終了の後は次のメッセージのMAIL FROMを待つ位置に戻る
    pub fn advance(&mut self, command: Command) -> Result<()> {
        let target = self.target(command)?;
        self.current = if command == Command::EndOfBody {
            Some(HELO_POS)
        } else {
            Some(target)
        };
        Ok(())
    }

    /// 状態を変えずに受け付け可否だけ確認（複合操作の事前検査用）
    pub fn check(&self, command: Command) -> Result<()> {
        self.target(command).map(|_| ())
    }

    /// 接続後（Connect通過済み、またはConnect省略）ならtrue
    /// Unknown・Abortはこの条件だけで受け付ける
    pub fn is_connected(&self) -> bool {
        self.current.is_some() || self.is_skipped(Command::Connect)
    }

    /// Abort: メッセージ途中なら次のMAIL FROM待ちへ戻す
    pub fn abort(&mut self) {
        if let Some(cur) = self.current {
            if cur >= MAIL_POS {
                self.current = Some(HELO_POS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StageTracker {
        StageTracker::new(ProtocolFlags::empty())
    }

    #[test]
    fn canonical_sequence_is_accepted() {
        let mut t = tracker();
        for cmd in [
            Command::Connect,
            Command::Helo,
            Command::Mail,
            Command::Rcpt,
            Command::Rcpt,
            Command::Header,
            Command::Header,
            Command::EndOfHeaders,
            Command::Body,
            Command::Body,
            Command::EndOfBody,
            // 同じ接続で2通目
            Command::Mail,
            Command::Rcpt,
            Command::EndOfHeaders,
            Command::EndOfBody,
        ] {
            t.advance(cmd).unwrap_or_else(|e| panic!("{:?}: {}", cmd, e));
        }
    }

    #[test]
    fn rcpt_before_mail_is_rejected() {
        let mut t = tracker();
        t.advance(Command::Connect).unwrap();
        t.advance(Command::Helo).unwrap();
        assert!(matches!(t.advance(Command::Rcpt), Err(Error::Protocol(_))));
        // 失敗時は状態を変えない
        assert_eq!(t.current(), Some(Command::Helo));
    }

    #[test]
    fn non_repeatable_steps_cannot_repeat_or_go_back() {
        let mut t = tracker();
        t.advance(Command::Connect).unwrap();
        assert!(t.advance(Command::Connect).is_err());
        t.advance(Command::Helo).unwrap();
        t.advance(Command::Helo).unwrap();
        t.advance(Command::Mail).unwrap();
        assert!(t.advance(Command::Mail).is_err());
        assert!(t.advance(Command::Helo).is_err());
    }

    #[test]
    fn body_requires_end_of_headers() {
        let mut t = tracker();
        for cmd in [Command::Connect, Command::Helo, Command::Mail, Command::Header] {
            t.advance(cmd).unwrap();
        }
        assert!(t.check(Command::Body).is_err());
        assert!(t.check(Command::EndOfBody).is_err());
    }

    #[test]
    fn negotiated_skips_count_as_passed() {
        let mut t = StageTracker::new(ProtocolFlags::NO_CONNECT | ProtocolFlags::NO_HELO);
        assert!(t.is_connected());
        t.advance(Command::Mail).unwrap();
        let mut t = StageTracker::new(ProtocolFlags::NO_EOH);
        for cmd in [Command::Connect, Command::Helo, Command::Mail, Command::Header, Command::Body] {
            t.advance(cmd).unwrap();
        }
    }

    #[test]
    fn abort_returns_to_mail_position() {
        let mut t = tracker();
        for cmd in [Command::Connect, Command::Helo, Command::Mail, Command::Rcpt] {
            t.advance(cmd).unwrap();
        }
        t.abort();
        assert_eq!(t.current(), Some(Command::Helo));
        t.advance(Command::Mail).unwrap();

        let mut early = tracker();
        early.advance(Command::Connect).unwrap();
        early.abort();
        assert_eq!(early.current(), Some(Command::Connect));
    }

    #[test]
    fn nothing_before_connect() {
        let t = tracker();
        assert!(!t.is_connected());
        assert!(t.check(Command::Helo).is_err());
        assert!(t.check(Command::Connect).is_ok());
    }
}
