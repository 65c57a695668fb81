//! Incremental `multipart/form-data` reader.
//!
//! Parts are surfaced one at a time and their bodies as a sequence of chunks,
//! so an uploaded file never has to sit in memory whole. A body that ends
//! before the closing delimiter yields `UnexpectedEof`.

use std::collections::HashMap;
use std::io::{self, Read};

const READ_SIZE: usize = 4096;
const MIN_CHUNK: usize = 1024;
const MAX_PART_HEADER_BYTES: usize = 8192;

/// Extract the boundary from a `Content-Type: multipart/form-data; boundary=...` value.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let media_type = params.next()?.trim();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|boundary| !boundary.is_empty())
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartHeaders {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Preamble,
    AfterDelimiter,
    InPart,
    Done,
}

pub struct MultipartReader<R: Read> {
    reader: R,
    delimiter: Vec<u8>,
    buf: Vec<u8>,
    eof: bool,
    state: State,
}

impl<R: Read> MultipartReader<R> {
    pub fn new(reader: R, boundary: &str) -> Self {
        Self {
            reader,
            delimiter: format!("\r\n--{}", boundary).into_bytes(),
            // The first delimiter has no leading CRLF; seed one so every
            // delimiter looks the same.
            buf: b"\r\n".to_vec(),
            eof: false,
            state: State::Preamble,
        }
    }

    fn fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut tmp = [0u8; READ_SIZE];
        let n = loop {
            match self.reader.read(&mut tmp) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        };
        if n == 0 {
            self.eof = true;
        }
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    fn fill_to(&mut self, len: usize) -> io::Result<()> {
        while self.buf.len() < len {
            if self.fill()? == 0 {
                return Err(truncated());
            }
        }
        Ok(())
    }

    /// Advance to the next part and return its headers, `None` after the
    /// closing delimiter. Any unread body of the current part is skipped.
    pub fn next_part(&mut self) -> io::Result<Option<PartHeaders>> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::InPart => {
                    while self.next_chunk()?.is_some() {}
                }
                State::Preamble => loop {
                    if let Some(pos) = find(&self.buf, &self.delimiter) {
                        self.buf.drain(..pos + self.delimiter.len());
                        self.state = State::AfterDelimiter;
                        break;
                    }
                    let keep = self.delimiter.len().min(self.buf.len());
                    let discard = self.buf.len() - keep;
                    self.buf.drain(..discard);
                    if self.fill()? == 0 {
                        return Err(truncated());
                    }
                },
                State::AfterDelimiter => {
                    self.fill_to(2)?;
                    if self.buf.starts_with(b"--") {
                        self.state = State::Done;
                        return Ok(None);
                    }
                    if !self.buf.starts_with(b"\r\n") {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "malformed multipart delimiter",
                        ));
                    }
                    self.buf.drain(..2);
                    let headers = self.read_part_headers()?;
                    self.state = State::InPart;
                    return Ok(Some(headers));
                }
            }
        }
    }

    fn read_part_headers(&mut self) -> io::Result<PartHeaders> {
        let end = loop {
            // A part with no headers starts directly with the blank line.
            if self.buf.starts_with(b"\r\n") {
                break 0;
            }
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                break pos + 2;
            }
            if self.buf.len() > MAX_PART_HEADER_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "multipart headers too large",
                ));
            }
            if self.fill()? == 0 {
                return Err(truncated());
            }
        };
        let raw = String::from_utf8_lossy(&self.buf[..end]).to_string();
        self.buf.drain(..end + 2);
        Ok(parse_part_headers(&raw))
    }

    /// Next slice of the current part's body, `None` at its end.
    pub fn next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.state != State::InPart {
            return Ok(None);
        }
        loop {
            if let Some(pos) = find(&self.buf, &self.delimiter) {
                if pos == 0 {
                    self.buf.drain(..self.delimiter.len());
                    self.state = State::AfterDelimiter;
                    return Ok(None);
                }
                return Ok(Some(self.buf.drain(..pos).collect()));
            }
            // Hold back enough bytes to catch a delimiter split across reads.
            if self.buf.len() >= self.delimiter.len() + MIN_CHUNK {
                let safe = self.buf.len() - self.delimiter.len();
                return Ok(Some(self.buf.drain(..safe).collect()));
            }
            if self.fill()? == 0 {
                return Err(truncated());
            }
        }
    }

    /// Read the rest of the current part as text (form fields).
    pub fn read_text(&mut self, limit: usize) -> io::Result<String> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk()? {
            out.extend_from_slice(&chunk);
            if out.len() > limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "form field too large",
                ));
            }
        }
        Ok(String::from_utf8_lossy(&out).to_string())
    }
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "multipart body truncated")
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_part_headers(raw: &str) -> PartHeaders {
    let mut headers = HashMap::new();
    for line in raw.split("\r\n") {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    let mut part = PartHeaders {
        content_type: headers.get("content-type").cloned(),
        ..PartHeaders::default()
    };
    if let Some(disposition) = headers.get("content-disposition") {
        for param in disposition.split(';').skip(1) {
            if let Some((key, value)) = param.trim().split_once('=') {
                let value = value.trim().trim_matches('"').to_string();
                match key.trim().to_lowercase().as_str() {
                    "name" => part.name = Some(value),
                    "filename" => part.filename = Some(value),
                    _ => {}
                }
            }
        }
    }
    part
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn body(file: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            b"--XyZ\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\n/photos\r\n",
        );
        body.extend_from_slice(
            b"--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n",
        );
        body.extend_from_slice(file);
        body.extend_from_slice(b"\r\n--XyZ--\r\n");
        body
    }

    fn collect_file<R: Read>(reader: &mut MultipartReader<R>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn boundary_parsing() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"abc\"").as_deref(),
            Some("abc")
        );
        assert_eq!(
            boundary_from_content_type("Multipart/Form-Data;boundary=----x").as_deref(),
            Some("----x")
        );
        assert!(boundary_from_content_type("application/json").is_none());
    }

    #[test]
    fn field_then_file() {
        let file: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = MultipartReader::new(Cursor::new(body(&file)), "XyZ");

        let field = reader.next_part().unwrap().unwrap();
        assert_eq!(field.name.as_deref(), Some("path"));
        assert_eq!(field.filename, None);
        assert_eq!(reader.read_text(1024).unwrap(), "/photos");

        let part = reader.next_part().unwrap().unwrap();
        assert_eq!(part.filename.as_deref(), Some("a.bin"));
        assert_eq!(part.content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(collect_file(&mut reader), file);
        assert!(reader.next_part().unwrap().is_none());
    }

    #[test]
    fn delimiter_split_across_reads() {
        let file = b"payload with \r\n-- near misses \r\n--XY".to_vec();
        let data = body(&file);
        for step in [1, 3, 7] {
            let mut reader = MultipartReader::new(
                Trickle {
                    data: data.clone(),
                    pos: 0,
                    step,
                },
                "XyZ",
            );
            reader.next_part().unwrap();
            reader.next_part().unwrap();
            assert_eq!(collect_file(&mut reader), file, "step {}", step);
        }
    }

    #[test]
    fn truncated_body_is_unexpected_eof() {
        let mut data = body(&[9u8; 3000]);
        data.truncate(data.len() - 200);
        let mut reader = MultipartReader::new(Cursor::new(data), "XyZ");
        reader.next_part().unwrap();
        reader.next_part().unwrap();
        let err = loop {
            match reader.next_chunk() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("truncated body ended cleanly"),
                Err(err) => break err,
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unread_part_is_skipped() {
        let mut reader = MultipartReader::new(Cursor::new(body(b"abc")), "XyZ");
        reader.next_part().unwrap();
        let part = reader.next_part().unwrap().unwrap();
        assert_eq!(part.name.as_deref(), Some("file"));
        assert!(reader.next_part().unwrap().is_none());
    }
}
