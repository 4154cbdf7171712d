// =========================
// frame.rs
// Milterフレームの符号化・復号化と非同期フレームI/O
//
// 【このファイルで使う主なクレート】
// - tokio: 非同期I/O（AsyncRead/AsyncWrite, AsyncReadExt, AsyncWriteExt）・タイムアウト（time::timeout）
// - async-trait: Modifierから型消去して使う送信トレイト（FrameSink）
// - crate::error: Framing/Closed/Ioエラー
//
// 【役割】
// - フレーム形式: 4バイト長(ビッグエンディアン、コマンド1バイト+ペイロード) + 1バイトコマンド + ペイロード
// - 長さ上限（max_payload）を超えるフレームの拒否
// - フェーズ1: 5バイトヘッダ受信 → フェーズ2: ペイロード受信（フレーム単位の期限付き）
// =========================

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// 長さプレフィックス(4) + コマンド(1)
pub const HEADER_SIZE: usize = 5;

/// 既定の最大ペイロード長（本文チャンク1つ分）
pub const DEFAULT_MAX_PAYLOAD: usize = 65535;

/// 本文チャンク1つの最大長（MILTER_CHUNK_SIZE）
pub const MAX_BODY_CHUNK: usize = 65535;

/// 1フレーム = コマンド1バイト + ペイロード
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Frame {
            command,
            payload: payload.into(),
        }
    }

    /// ペイロード無しのフレーム（Continue応答、EOHなど）
    pub fn bare(command: u8) -> Self {
        Frame {
            command,
            payload: Vec::new(),
        }
    }

    /// 長さフィールドの値（コマンド1バイト + ペイロード長）
    pub fn wire_len(&self) -> usize {
        self.payload.len() + 1
    }

    /// ワイヤ形式へ符号化
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len()); // サイズ4+コマンド1+ペイロード
        buf.extend_from_slice(&(self.wire_len() as u32).to_be_bytes()); // サイズ（4バイト）
        buf.push(self.command); // コマンド（1バイト）
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// バッファ先頭から1フレームを復号化する
    ///
    /// # 戻り値
    /// - `Ok(Some((frame, consumed)))`: 1フレーム分そろっている
    /// - `Ok(None)`: まだデータ不足
    /// - `Err(Framing)`: 長さが0、または上限超過
    pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        check_length(size, max_payload)?;
        if buf.len() < 4 + size {
            return Ok(None);
        }
        let frame = Frame::new(buf[4], &buf[HEADER_SIZE..4 + size]);
        Ok(Some((frame, 4 + size)))
    }
}

// 長さフィールドの妥当性検査（コマンド1バイト分は必須、ペイロードは上限以内）
fn check_length(size: usize, max_payload: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::Framing("zero length frame".to_string()));
    }
    if size - 1 > max_payload {
        return Err(Error::Framing(format!(
            "frame payload of {} bytes exceeds limit of {} bytes",
            size - 1,
            max_payload
        )));
    }
    Ok(())
}

/// 二重ストリーム上のフレーム送受信
///
/// 1回の送受信ごとに`deadline`（設定のClient_timeout）を適用する。
/// 期限切れはI/Oレベルのキャンセル（TimedOut）として扱う。
#[derive(Debug)]
pub struct FrameStream<S> {
    stream: S,
    max_payload: usize,
    deadline: Option<Duration>,
}

impl<S> FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, max_payload: usize, deadline: Option<Duration>) -> Self {
        FrameStream {
            stream,
            max_payload,
            deadline,
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// 内部ストリームを取り出す
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// 1フレーム受信
    /// - フレーム境界での切断はClosed
    /// - フレーム途中での切断はFraming
    pub async fn recv(&mut self) -> Result<Frame> {
        let deadline = self.deadline;
        with_deadline(deadline, self.recv_inner()).await
    }

    async fn recv_inner(&mut self) -> Result<Frame> {
        // --- フェーズ1: 5バイトヘッダ受信（4バイト:サイズ + 1バイト:コマンド） ---
        let mut header = [0u8; HEADER_SIZE];
        let mut read_bytes = 0;
        while read_bytes < HEADER_SIZE {
            let n = self.stream.read(&mut header[read_bytes..]).await?;
            if n == 0 {
                if read_bytes == 0 {
                    return Err(Error::Closed); // フレーム境界で相手が切断
                }
                return Err(Error::Framing(format!(
                    "stream ended after {} header bytes",
                    read_bytes
                )));
            }
            read_bytes += n;
        }
        let size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        check_length(size, self.max_payload)?;

        // --- フェーズ2: ペイロード受信 ---
        let mut payload = vec![0u8; size - 1];
        let mut filled = 0;
        while filled < payload.len() {
            let n = self.stream.read(&mut payload[filled..]).await?;
            if n == 0 {
                return Err(Error::Framing(format!(
                    "stream ended mid-frame ({} of {} payload bytes)",
                    filled,
                    payload.len()
                )));
            }
            filled += n;
        }
        Ok(Frame::new(header[4], payload))
    }

    /// 1フレーム送信（上限超過のフレームは書き込まずにFramingを返す）
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload.len() > self.max_payload {
            return Err(Error::Framing(format!(
                "refusing to send {} byte payload (limit {})",
                frame.payload.len(),
                self.max_payload
            )));
        }
        let deadline = self.deadline;
        let bytes = frame.encode();
        with_deadline(deadline, async {
            self.stream.write_all(&bytes).await?;
            self.stream.flush().await?;
            Ok(())
        })
        .await
    }

    /// 書き込み側を閉じる
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

// 期限付きで非同期処理を実行（期限なしならそのまま待つ）
async fn with_deadline<T>(
    deadline: Option<Duration>,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::timed_out()),
        },
        None => fut.await,
    }
}

/// readerからbufが埋まるか終端に達するまで読み込む
/// 戻り値が0なら終端。buf.len()未満なら以降の読み込みは0を返す
pub async fn fill_chunk<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// フレーム送信先の型消去インターフェース（Modifierが使う）
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: &Frame) -> Result<()>;

    /// 送信可能な最大ペイロード長
    fn payload_limit(&self) -> usize;
}

#[async_trait]
impl<S> FrameSink for FrameStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        self.send(frame).await
    }

    fn payload_limit(&self) -> usize {
        self.max_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn encode_prefixes_length_including_command() {
        let frame = Frame::new(b'H', b"mx.example.org\0".to_vec());
        let bytes = frame.encode();
        assert_eq!(&bytes[..4], &16u32.to_be_bytes());
        assert_eq!(bytes[4], b'H');
        assert_eq!(&bytes[5..], b"mx.example.org\0");
    }

    #[test]
    fn decode_handles_partial_and_complete_input() {
        let bytes = Frame::bare(b'c').encode();
        assert_eq!(bytes, vec![0, 0, 0, 1, b'c']);
        assert!(Frame::decode(&bytes[..3], 16).unwrap().is_none());
        assert!(Frame::decode(&bytes[..4], 16).unwrap().is_none());
        let (frame, used) = Frame::decode(&bytes, 16).unwrap().unwrap();
        assert_eq!(frame, Frame::bare(b'c'));
        assert_eq!(used, 5);
    }

    #[test]
    fn decode_rejects_zero_and_oversized_lengths() {
        assert!(matches!(
            Frame::decode(&[0, 0, 0, 0, b'c'], 16),
            Err(Error::Framing(_))
        ));
        let oversized = Frame::new(b'B', vec![b'x'; 17]).encode();
        assert!(matches!(Frame::decode(&oversized, 16), Err(Error::Framing(_))));
        let exact = Frame::new(b'B', vec![b'x'; 16]).encode();
        assert!(Frame::decode(&exact, 16).unwrap().is_some());
    }

    #[tokio::test]
    async fn stream_round_trips_empty_and_max_payloads() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = FrameStream::new(a, DEFAULT_MAX_PAYLOAD, None);
        let mut rx = FrameStream::new(b, DEFAULT_MAX_PAYLOAD, None);
        let empty = Frame::bare(b'N');
        let full = Frame::new(b'B', vec![0xAB; DEFAULT_MAX_PAYLOAD]);
        tx.send(&empty).await.unwrap();
        tx.send(&full).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), empty);
        assert_eq!(rx.recv().await.unwrap(), full);
    }

    #[tokio::test]
    async fn send_refuses_payload_over_limit() {
        let (a, _b) = tokio::io::duplex(64);
        let mut tx = FrameStream::new(a, 8, None);
        let err = tx.send(&Frame::new(b'B', vec![0; 9])).await.unwrap_err();
        assert!(matches!(err, Error::Framing(_)));
    }

    #[tokio::test]
    async fn clean_eof_is_closed_and_mid_frame_eof_is_framing() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut rx = FrameStream::new(b, 16, None);
        assert!(matches!(rx.recv().await, Err(Error::Closed)));

        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 6, b'H', b'a']).await.unwrap();
        drop(a);
        let mut rx = FrameStream::new(b, 16, None);
        assert!(matches!(rx.recv().await, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_reading_payload() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[0, 1, 0, 0, b'B']).await.unwrap();
        let mut rx = FrameStream::new(b, 1024, None);
        assert!(matches!(rx.recv().await, Err(Error::Framing(_))));
    }

    #[tokio::test]
    async fn fill_chunk_fills_buffer_across_short_reads() {
        let (mut a, mut b) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            a.write_all(b"0123456789").await.unwrap();
        });
        let mut buf = [0u8; 6];
        assert_eq!(fill_chunk(&mut b, &mut buf).await.unwrap(), 6);
        assert_eq!(&buf, b"012345");
        writer.await.unwrap();
        assert_eq!(fill_chunk(&mut b, &mut buf).await.unwrap(), 4);
        assert_eq!(fill_chunk(&mut b, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deadline_expiry_surfaces_as_timed_out() {
        let (_a, b) = tokio::io::duplex(64);
        let mut rx = FrameStream::new(b, 16, Some(Duration::from_millis(20)));
        match rx.recv().await {
            Err(Error::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
