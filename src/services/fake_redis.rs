//! In-process stand-in for the Redis node directory. Speaks just enough RESP
//! for `RedisDirectory`: PING, SCAN ... MATCH, GET, and `+OK` for anything a
//! client sends while setting up its connection.

use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub enum Record {
    Value(Vec<u8>),
    /// A key holding a non-string type; GET answers WRONGTYPE.
    WrongType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    /// Answers everything except SCAN, which never returns.
    StallScan,
    /// Accepts connections and never answers.
    Silent,
}

pub struct FakeRedis {
    pub url: String,
}

impl FakeRedis {
    pub async fn start(records: Vec<(&str, Record)>, behavior: Behavior) -> Self {
        let records: Arc<Vec<(String, Record)>> = Arc::new(
            records
                .into_iter()
                .map(|(key, record)| (key.to_string(), record))
                .collect(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&records), behavior));
            }
        });

        Self {
            url: format!("redis://{}/", addr),
        }
    }
}

async fn serve(stream: TcpStream, records: Arc<Vec<(String, Record)>>, behavior: Behavior) -> io::Result<()> {
    if behavior == Behavior::Silent {
        // keeps the socket open without ever answering
        std::future::pending::<()>().await;
    }

    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Some(args) = read_command(&mut reader).await? {
        let command = args.first().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
        let reply = match command.as_str() {
            "PING" => b"+PONG\r\n".to_vec(),
            "SCAN" if behavior == Behavior::StallScan => std::future::pending().await,
            "SCAN" => {
                let pattern = args
                    .iter()
                    .position(|a| a.eq_ignore_ascii_case("MATCH"))
                    .and_then(|i| args.get(i + 1))
                    .map(|p| p.trim_end_matches('*').to_string())
                    .unwrap_or_default();
                let keys: Vec<&str> = records
                    .iter()
                    .map(|(key, _)| key.as_str())
                    .filter(|key| key.starts_with(&pattern))
                    .collect();

                let mut reply = b"*2\r\n$1\r\n0\r\n".to_vec();
                reply.extend(format!("*{}\r\n", keys.len()).into_bytes());
                for key in keys {
                    reply.extend(bulk(key.as_bytes()));
                }
                reply
            }
            "GET" => match args.get(1).and_then(|key| records.iter().find(|(k, _)| k == key)) {
                Some((_, Record::Value(value))) => bulk(value),
                Some((_, Record::WrongType)) => {
                    b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n".to_vec()
                }
                None => b"$-1\r\n".to_vec(),
            },
            _ => b"+OK\r\n".to_vec(),
        };
        write.write_all(&reply).await?;
    }
    Ok(())
}

fn bulk(value: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", value.len()).into_bytes();
    out.extend_from_slice(value);
    out.extend_from_slice(b"\r\n");
    out
}

/// One RESP array of bulk strings, or `None` at end of stream.
async fn read_command<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<String>>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let count = header(&line, '*')?;

    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        line.clear();
        reader.read_line(&mut line).await?;
        let len = header(&line, '$')?;
        let mut buf = vec![0; len + 2];
        reader.read_exact(&mut buf).await?;
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Ok(Some(args))
}

fn header(line: &str, marker: char) -> io::Result<usize> {
    line.trim_end()
        .strip_prefix(marker)
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unexpected RESP line {:?}", line)))
}
