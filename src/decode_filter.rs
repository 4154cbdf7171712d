// =========================
// decode_filter.rs
// milter_engine サンプルフィルタ（メール全体の再構成とMIMEパース出力）
//
// 【このファイルで使う主なクレート】
// - mail_parser: MIMEメールのパース・構造化・本文抽出（MessageParser, MimeHeaders）
// - async-trait: Filterトレイトの実装
// - milter_engine: Filter/Modifier/Action、printdaytimeln!
//
// 【役割】
// - CONNECT/HELO/MAIL FROM/RCPT TOの内容をログ出力
// - ヘッダ・本文チャンクを受信順に蓄積し、BODYEOB時にメール全体を再構成してパース
// - From/To/Subject/Content-Type/パート構成の出力
// - 合意済みならX-Milter-Decodedヘッダでパース結果の要約を付与
// =========================

use async_trait::async_trait;
use mail_parser::{MessageParser, MimeHeaders};

use milter_engine::{
    eprintdaytimeln, printdaytimeln, Action, ActionFlags, ConnectInfo, Filter, FilterResult,
    Modifier,
};

/// パース結果の要約
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailSummary {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text_parts: usize,
    pub other_parts: usize,
}

impl MailSummary {
    /// X-Milter-Decodedヘッダの値
    pub fn header_value(&self) -> String {
        format!("text={}; other={}", self.text_parts, self.other_parts)
    }
}

/// 1接続分の受信内容
#[derive(Debug, Default)]
pub struct DecodeFilter {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl DecodeFilter {
    fn reset(&mut self) {
        self.headers.clear();
        self.body.clear();
    }
}

#[async_trait]
impl Filter for DecodeFilter {
    async fn connect(&mut self, info: &ConnectInfo, _m: &mut Modifier<'_>) -> FilterResult {
        match info.ip() {
            Some(ip) => printdaytimeln!("[connect] host={} ip={} port={}", info.hostname, ip, info.port),
            None => printdaytimeln!("[connect] host={} addr={}", info.hostname, info.address),
        }
        Ok(Action::Continue)
    }

    async fn helo(&mut self, name: &str, _m: &mut Modifier<'_>) -> FilterResult {
        printdaytimeln!("[helo] {}", name);
        Ok(Action::Continue)
    }

    async fn mail_from(&mut self, from: &str, args: &[String], m: &mut Modifier<'_>) -> FilterResult {
        printdaytimeln!("[mail from] {} {:?}", from, args);
        if let Some(qid) = m.macro_value("i") {
            printdaytimeln!("[mail from] queue id: {}", qid);
        }
        Ok(Action::Continue)
    }

    async fn rcpt_to(&mut self, rcpt: &str, args: &[String], _m: &mut Modifier<'_>) -> FilterResult {
        printdaytimeln!("[rcpt to] {} {:?}", rcpt, args);
        Ok(Action::Continue)
    }

    async fn header(&mut self, name: &str, value: &str, _m: &mut Modifier<'_>) -> FilterResult {
        self.headers.push((name.to_string(), value.to_string()));
        Ok(Action::Continue)
    }

    async fn body_chunk(&mut self, chunk: &[u8], _m: &mut Modifier<'_>) -> FilterResult {
        self.body.extend_from_slice(chunk);
        Ok(Action::Continue)
    }

    async fn body(&mut self, m: &mut Modifier<'_>) -> FilterResult {
        let summary = parse_mail(&self.headers, &self.body);
        self.reset();
        if let Some(summary) = summary {
            if m.capabilities().actions.contains(ActionFlags::ADD_HEADERS) {
                m.add_header("X-Milter-Decoded", &summary.header_value()).await?;
            }
        }
        Ok(Action::Continue)
    }

    async fn abort(&mut self) {
        self.reset();
    }
}

// 改行コードをCRLFに統一（OS依存の改行コード差異を吸収）
fn to_crlf(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 32);
    let mut prev = 0u8;
    for &b in body {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    out
}

// アドレス一覧を"名前 <アドレス>, ..."形式へ
fn format_addresses(addrs: Option<&mail_parser::Address>) -> String {
    addrs
        .map(|addrs| {
            addrs
                .iter()
                .map(|addr| {
                    let name = addr.name().unwrap_or("");
                    let address = addr.address().unwrap_or("");
                    if !name.is_empty() {
                        format!("{} <{}>", name, address)
                    } else {
                        address.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "(なし)".to_string())
}

/// ヘッダ＋本文を合体してメール全体をパース・出力する
///
/// # 引数
/// - `headers`: 受信順のヘッダ
/// - `body`: 本文チャンクを連結したもの
///
/// # 戻り値
/// パースできなければNone
pub fn parse_mail(headers: &[(String, String)], body: &[u8]) -> Option<MailSummary> {
    let mut raw = Vec::new();
    for (name, value) in headers {
        raw.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    raw.extend_from_slice(b"\r\n"); // ヘッダ部とボディ部の区切り
    raw.extend_from_slice(&to_crlf(body));

    let msg = match MessageParser::default().parse(&raw[..]) {
        Some(msg) => msg,
        None => {
            eprintdaytimeln!("[mail-parser] parse error");
            return None;
        }
    };

    let from = format_addresses(msg.from());
    let to = format_addresses(msg.to());
    let subject = msg.subject().unwrap_or("(なし)").to_string();
    printdaytimeln!("[mail-parser] from: {}", from);
    printdaytimeln!("[mail-parser] to: {}", to);
    printdaytimeln!("[mail-parser] subject: {}", subject);
    if let Some(ct) = msg
        .headers()
        .iter()
        .find(|h| h.name().eq_ignore_ascii_case("Content-Type"))
        .map(|h| h.value())
    {
        printdaytimeln!("[mail-parser] content-type: {:?}", ct);
    }

    let mut text_parts = 0;
    let mut other_parts = 0;
    for part in msg.parts.iter() {
        // multipart/*は親パートなので数えない
        let is_multipart = part
            .content_type()
            .is_some_and(|ct| ct.c_type.eq_ignore_ascii_case("multipart"));
        if is_multipart {
            continue;
        }
        if part.is_text() {
            text_parts += 1;
        } else {
            other_parts += 1;
            let fname = part
                .content_disposition()
                .and_then(|cd| {
                    cd.attributes()
                        .unwrap_or(&[])
                        .iter()
                        .find(|attr| attr.name.eq_ignore_ascii_case("filename"))
                        .map(|attr| attr.value.to_string())
                })
                .unwrap_or_else(|| "(ファイル名なし)".to_string());
            printdaytimeln!(
                "[mail-parser] 非テキストパート({}): encoding={:?}, filename={}",
                other_parts,
                part.encoding,
                fname
            );
        }
    }
    printdaytimeln!("[mail-parser] テキストパート数: {}", text_parts);
    printdaytimeln!("[mail-parser] 非テキストパート数: {}", other_parts);
    for idx in 0..text_parts {
        if let Some(text) = msg.body_text(idx) {
            printdaytimeln!("[mail-parser] TEXT本文({}): {}", idx + 1, text);
        }
    }

    Some(MailSummary {
        from,
        to,
        subject,
        text_parts,
        other_parts,
    })
}
