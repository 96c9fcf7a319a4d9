use crate::{Error, Kv, MAX_OBJECT_DEPTH, Result, Value, buffer};

/// Parses JSON from `input` in place.
///
/// String escapes are rewritten within the input buffer, so the returned
/// value's buffers alias (now-modified) regions of `input`. Trailing
/// non-whitespace is rejected. Maps are returned in source order and are NOT
/// canonicalized; callers needing canonical ordering run
/// [`canonicalize`](crate::canonicalize) afterwards.
pub fn decode_destructive(input: &mut [u8]) -> Result<Value<'_>> {
    let mut parser = Parser { rest: input };
    parser.skip_ws();
    let value = parser.parse_value(0)?;
    parser.skip_ws();
    if !parser.rest.is_empty() {
        return Err(Error::Parse);
    }
    Ok(value)
}

struct Parser<'a> {
    rest: &'a mut [u8],
}

impl<'a> Parser<'a> {
    #[inline]
    fn peek(&self) -> Option<u8> {
        self.rest.first().copied()
    }

    /// Detaches the first `n` bytes. The returned region is disjoint from
    /// everything the parser touches afterwards, which is what lets decoded
    /// strings keep borrowing it.
    fn take(&mut self, n: usize) -> &'a mut [u8] {
        let rest = core::mem::take(&mut self.rest);
        let (head, tail) = rest.split_at_mut(n);
        self.rest = tail;
        head
    }

    fn skip_ws(&mut self) {
        let n = self
            .rest
            .iter()
            .take_while(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
            .count();
        if n > 0 {
            self.take(n);
        }
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        if self.peek() == Some(c) {
            self.take(1);
            Ok(())
        } else {
            Err(Error::Parse)
        }
    }

    fn expect_literal(&mut self, lit: &[u8]) -> Result<()> {
        if self.rest.len() >= lit.len() && &self.rest[..lit.len()] == lit {
            self.take(lit.len());
            Ok(())
        } else {
            Err(Error::Parse)
        }
    }

    fn parse_value(&mut self, depth: usize) -> Result<Value<'a>> {
        if depth > MAX_OBJECT_DEPTH {
            return Err(Error::Range);
        }
        match self.peek().ok_or(Error::Parse)? {
            b'n' => {
                self.expect_literal(b"null")?;
                Ok(Value::Null)
            }
            b't' => {
                self.expect_literal(b"true")?;
                Ok(Value::Bool(true))
            }
            b'f' => {
                self.expect_literal(b"false")?;
                Ok(Value::Bool(false))
            }
            b'"' => Ok(Value::Buf(self.parse_string()?)),
            b'[' => self.parse_list(depth),
            b'{' => self.parse_map(depth),
            b'-' | b'0'..=b'9' => self.parse_number(),
            _ => Err(Error::Parse),
        }
    }

    fn parse_list(&mut self, depth: usize) -> Result<Value<'a>> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.take(1);
            return Ok(Value::List(items));
        }
        loop {
            self.skip_ws();
            items.push(self.parse_value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.take(1);
                }
                Some(b']') => {
                    self.take(1);
                    return Ok(Value::List(items));
                }
                _ => return Err(Error::Parse),
            }
        }
    }

    fn parse_map(&mut self, depth: usize) -> Result<Value<'a>> {
        self.expect(b'{')?;
        let mut pairs = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.take(1);
            return Ok(Value::Map(pairs));
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.skip_ws();
            self.expect(b':')?;
            self.skip_ws();
            let value = self.parse_value(depth + 1)?;
            pairs.push(Kv::new(key, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.take(1);
                }
                Some(b'}') => {
                    self.take(1);
                    return Ok(Value::Map(pairs));
                }
                _ => return Err(Error::Parse),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Value<'a>> {
        let len = self
            .rest
            .iter()
            .take_while(|b| matches!(b, b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E'))
            .count();
        let token = &*self.take(len);

        if !token.iter().any(|b| matches!(b, b'.' | b'e' | b'E')) {
            match buffer::parse_i64(token) {
                Ok(i) => return Ok(Value::I64(i)),
                // Magnitude beyond i64; fall through to f64.
                Err(Error::Range) => {}
                Err(_) => return Err(Error::Parse),
            }
        }

        let text = core::str::from_utf8(token).map_err(|_| Error::Parse)?;
        let f: f64 = text.parse().map_err(|_| Error::Parse)?;
        Ok(Value::F64(f))
    }

    /// Parses a string token, unescaping in place within the input buffer.
    fn parse_string(&mut self) -> Result<&'a [u8]> {
        self.expect(b'"')?;

        // Find the closing quote; a quote is closing when not preceded by an
        // escaping backslash. Raw control characters are malformed.
        let mut escaped = false;
        let mut end = None;
        for (i, &b) in self.rest.iter().enumerate() {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                end = Some(i);
                break;
            } else if b < 0x20 {
                return Err(Error::Parse);
            }
        }
        let end = end.ok_or(Error::Parse)?;

        let token = self.take(end);
        self.take(1); // closing quote

        let len = unescape_in_place(token)?;
        let unescaped = &token[..len];
        core::str::from_utf8(unescaped).map_err(|_| Error::Parse)?;
        Ok(unescaped)
    }
}

/// Rewrites escapes within `buf`, returning the unescaped length. Escaped
/// forms are never shorter than their replacements, so the write cursor never
/// overtakes the read cursor.
fn unescape_in_place(buf: &mut [u8]) -> Result<usize> {
    let mut r = 0;
    let mut w = 0;

    while r < buf.len() {
        let b = buf[r];
        if b != b'\\' {
            buf[w] = b;
            r += 1;
            w += 1;
            continue;
        }

        r += 1;
        let esc = *buf.get(r).ok_or(Error::Parse)?;
        r += 1;
        match esc {
            b'"' | b'\\' | b'/' => {
                buf[w] = esc;
                w += 1;
            }
            b'b' => {
                buf[w] = 0x08;
                w += 1;
            }
            b'f' => {
                buf[w] = 0x0C;
                w += 1;
            }
            b'n' => {
                buf[w] = b'\n';
                w += 1;
            }
            b'r' => {
                buf[w] = b'\r';
                w += 1;
            }
            b't' => {
                buf[w] = b'\t';
                w += 1;
            }
            b'u' => {
                let unit = parse_hex4(buf.get(r..r + 4).ok_or(Error::Parse)?)?;
                r += 4;

                let code = if (0xD800..0xDC00).contains(&unit) {
                    // High surrogate; a low surrogate escape must follow.
                    if buf.get(r..r + 2) != Some(b"\\u") {
                        return Err(Error::Parse);
                    }
                    r += 2;
                    let low = parse_hex4(buf.get(r..r + 4).ok_or(Error::Parse)?)?;
                    r += 4;
                    if !(0xDC00..0xE000).contains(&low) {
                        return Err(Error::Parse);
                    }
                    0x10000 + (u32::from(unit - 0xD800) << 10) + u32::from(low - 0xDC00)
                } else if (0xDC00..0xE000).contains(&unit) {
                    // Lone low surrogate.
                    return Err(Error::Parse);
                } else {
                    u32::from(unit)
                };

                // The escape consumed at least 6 bytes and UTF-8 needs at
                // most 4, so the write stays behind the read cursor.
                let ch = char::from_u32(code).ok_or(Error::Parse)?;
                let len = ch.len_utf8();
                ch.encode_utf8(&mut buf[w..w + len]);
                w += len;
            }
            _ => return Err(Error::Parse),
        }
    }

    Ok(w)
}

fn parse_hex4(digits: &[u8]) -> Result<u16> {
    let text = core::str::from_utf8(digits).map_err(|_| Error::Parse)?;
    u16::from_str_radix(text, 16).map_err(|_| Error::Parse)
}
