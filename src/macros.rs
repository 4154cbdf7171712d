// =========================
// macros.rs
// ステージ別マクロの保持
//
// 【このファイルで使う主なクレート】
// - std: コレクション（BTreeMap）
// - crate::command: MacroStage
//
// 【役割】
// - SMFIC_MACROで届いたマクロをステージごとに丸ごと上書き保存
// - {name}形式・name形式どちらでも検索できる
// - メッセージ単位のマクロのクリア（Abort・本文終了時）
// =========================

use std::collections::BTreeMap;

use crate::command::MacroStage;

/// ステージごとのマクロ表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MacroTable {
    stages: BTreeMap<MacroStage, Vec<(String, String)>>,
}

// "{name}" → "name"
fn bare_name(name: &str) -> &str {
    name.strip_prefix('{')
        .and_then(|n| n.strip_suffix('}'))
        .unwrap_or(name)
}

impl MacroTable {
    pub fn new() -> Self {
        MacroTable::default()
    }

    /// ステージのマクロを丸ごと置き換える
    pub fn set(&mut self, stage: MacroStage, macros: Vec<(String, String)>) {
        self.stages.insert(stage, macros);
    }

    /// ステージのマクロ一覧
    pub fn stage(&self, stage: MacroStage) -> Option<&[(String, String)]> {
        self.stages.get(&stage).map(Vec::as_slice)
    }

    /// マクロ値の検索（SMTPの進行順で後のステージを優先、MacroStage::rank）
    /// 例: get("tls_version") と get("{tls_version}") は同じ値を返す
    pub fn get(&self, name: &str) -> Option<&str> {
        let wanted = bare_name(name);
        self.stages.values().rev().find_map(|macros| {
            macros
                .iter()
                .find(|(k, _)| bare_name(k) == wanted)
                .map(|(_, v)| v.as_str())
        })
    }

    /// メッセージ単位（MAIL FROM以降）のマクロを消す
    pub fn clear_message(&mut self) {
        self.stages.retain(|stage, _| !stage.is_message_scoped());
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn lookup_ignores_braces() {
        let mut table = MacroTable::new();
        table.set(MacroStage::Helo, pairs(&[("{tls_version}", "TLSv1.3")]));
        assert_eq!(table.get("tls_version"), Some("TLSv1.3"));
        assert_eq!(table.get("{tls_version}"), Some("TLSv1.3"));
        assert_eq!(table.get("j"), None);
    }

    #[test]
    fn set_overwrites_whole_stage() {
        let mut table = MacroTable::new();
        table.set(MacroStage::Mail, pairs(&[("i", "QID1"), ("{mail_addr}", "a@b")]));
        table.set(MacroStage::Mail, pairs(&[("i", "QID2")]));
        assert_eq!(table.get("i"), Some("QID2"));
        assert_eq!(table.get("mail_addr"), None);
    }

    #[test]
    fn later_stage_wins_and_message_scope_clears() {
        let mut table = MacroTable::new();
        table.set(MacroStage::Connect, pairs(&[("j", "mx.example.org"), ("i", "early")]));
        table.set(MacroStage::EndOfBody, pairs(&[("i", "QID9")]));
        assert_eq!(table.get("i"), Some("QID9"));
        table.clear_message();
        assert_eq!(table.get("i"), Some("early"));
        assert_eq!(table.get("j"), Some("mx.example.org"));
        assert!(table.stage(MacroStage::EndOfBody).is_none());
    }

    #[test]
    fn precedence_follows_smtp_order_not_wire_bytes() {
        let mut table = MacroTable::new();
        table.set(MacroStage::EndOfBody, pairs(&[("i", "QID-eob")]));
        table.set(MacroStage::Mail, pairs(&[("i", "QID-mail")]));
        table.set(MacroStage::Unknown, pairs(&[("i", "QID-unknown")]));
        assert_eq!(table.get("i"), Some("QID-eob"));

        let mut table = MacroTable::new();
        table.set(MacroStage::Helo, pairs(&[("{auth_type}", "PLAIN")]));
        table.set(MacroStage::Unknown, pairs(&[("auth_type", "none")]));
        assert_eq!(table.get("auth_type"), Some("PLAIN"));
    }
}
