// =========================
// modifier.rs
// コールバック中だけ有効なメッセージ変更ハンドル
//
// 【このファイルで使う主なクレート】
// - tokio: 置換本文の非同期読み込み（io::AsyncRead）
// - crate::frame: FrameSink（送信先）、本文チャンク分割
// - crate::negotiate: Capabilities（合意済みアクションの検査）
// - crate::macros: マクロ参照
//
// 【役割】
// - ヘッダ追加・変更・挿入・削除、宛先追加・削除、送信者変更、本文置換、進捗通知
// - 各呼び出しはネゴシエーション結果を書き込み前に検査し、呼び出し順にそのまま送信
// - 借用の寿命で「コールバックの間だけ使える」ことを保証
// =========================

use tokio::io::AsyncRead;

use crate::action::ModifyAction;
use crate::command::MacroStage;
use crate::error::{Error, Result};
use crate::frame::{fill_chunk, Frame, FrameSink, MAX_BODY_CHUNK};
use crate::macros::MacroTable;
use crate::message::Reply;
use crate::negotiate::Capabilities;

/// メッセージ変更ハンドル
///
/// `Filter`の各コールバックに渡される。変更アクションは本文終了（`Filter::body`）の
/// 間だけ送信でき、それ以外のステージでは何も書き込まずにエラーを返す。
pub struct Modifier<'a> {
    sink: &'a mut dyn FrameSink,
    caps: Capabilities,
    macros: &'a MacroTable,
    at_end_of_body: bool,
    broken: bool,
}

impl<'a> Modifier<'a> {
    pub(crate) fn new(
        sink: &'a mut dyn FrameSink,
        caps: Capabilities,
        macros: &'a MacroTable,
        at_end_of_body: bool,
    ) -> Self {
        Modifier {
            sink,
            caps,
            macros,
            at_end_of_body,
            broken: false,
        }
    }

    /// 合意済みケイパビリティ
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// マクロ値（{name}形式・name形式どちらでも可）
    pub fn macro_value(&self, name: &str) -> Option<&str> {
        self.macros.get(name)
    }

    /// 特定ステージのマクロ一覧
    pub fn macros(&self, stage: MacroStage) -> Option<&[(String, String)]> {
        self.macros.stage(stage)
    }

    /// 送信中にI/Oエラーが起きたか（セッションは継続不可）
    pub(crate) fn is_broken(&self) -> bool {
        self.broken
    }

    /// ヘッダを末尾に追加
    pub async fn add_header(&mut self, name: &str, value: &str) -> Result<()> {
        self.send(ModifyAction::AddHeader {
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// ヘッダを指定位置（0始まり、全ヘッダ中の位置）に挿入
    pub async fn insert_header(&mut self, index: u32, name: &str, value: &str) -> Result<()> {
        self.send(ModifyAction::InsertHeader {
            index,
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// 同名ヘッダのindex番目（1始まり、受信順）の値を変更
    pub async fn change_header(&mut self, index: u32, name: &str, value: &str) -> Result<()> {
        self.send(ModifyAction::ChangeHeader {
            index,
            name: name.to_string(),
            value: value.to_string(),
        })
        .await
    }

    /// 同名ヘッダのindex番目（1始まり）を削除（空値でのChangeHeader）
    pub async fn delete_header(&mut self, index: u32, name: &str) -> Result<()> {
        self.change_header(index, name, "").await
    }

    pub async fn add_recipient(&mut self, recipient: &str) -> Result<()> {
        self.send(ModifyAction::AddRecipient {
            recipient: recipient.to_string(),
            args: None,
        })
        .await
    }

    /// ESMTP引数付きで宛先を追加
    pub async fn add_recipient_with_args(&mut self, recipient: &str, args: &str) -> Result<()> {
        self.send(ModifyAction::AddRecipient {
            recipient: recipient.to_string(),
            args: Some(args.to_string()),
        })
        .await
    }

    pub async fn delete_recipient(&mut self, recipient: &str) -> Result<()> {
        self.send(ModifyAction::DeleteRecipient {
            recipient: recipient.to_string(),
        })
        .await
    }

    /// エンベロープ送信者を変更
    pub async fn change_from(&mut self, from: &str, args: Option<&str>) -> Result<()> {
        self.send(ModifyAction::ChangeFrom {
            from: from.to_string(),
            args: args.map(str::to_string),
        })
        .await
    }

    /// 本文を置き換える（フレーム上限ごとに分割して送信）
    pub async fn replace_body<R>(&mut self, mut body: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.check(ModifyAction::ReplaceBody { chunk: Vec::new() }.required_flag())?;
        let mut buf = vec![0u8; MAX_BODY_CHUNK.min(self.sink.payload_limit())];
        let mut sent_any = false;
        loop {
            let n = fill_chunk(&mut body, &mut buf).await?;
            if n == 0 && sent_any {
                break;
            }
            let frame = Reply::Modify(ModifyAction::ReplaceBody {
                chunk: buf[..n].to_vec(),
            })
            .to_frame();
            self.write(&frame).await?;
            sent_any = true;
            if n < buf.len() {
                break; // 終端に到達
            }
        }
        Ok(())
    }

    /// 処理中であることをMTAへ通知（タイムアウト延長）
    pub async fn progress(&mut self) -> Result<()> {
        if !self.at_end_of_body {
            return Err(self.wrong_stage());
        }
        self.write(&Reply::Progress.to_frame()).await
    }

    // 検査してから1アクションを送信
    async fn send(&mut self, action: ModifyAction) -> Result<()> {
        self.check(action.required_flag())?;
        let frame = Reply::Modify(action).to_frame();
        self.write(&frame).await
    }

    // 書き込み前の検査（ステージ・合意済みアクション）
    fn check(&self, required: crate::flags::ActionFlags) -> Result<()> {
        if !self.at_end_of_body {
            return Err(self.wrong_stage());
        }
        self.caps.check_action(required)
    }

    fn wrong_stage(&self) -> Error {
        Error::UnsupportedAction("modification outside end of body".to_string())
    }

    async fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.broken {
            return Err(Error::Closed);
        }
        let result = self.sink.send_frame(frame).await;
        if result.is_err() {
            self.broken = true;
        }
        result
    }
}
