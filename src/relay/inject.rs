//! Parsing of operator-supplied payloads for manual injection.
//!
//! Board-bound payloads are typed as hex; app-bound payloads are the
//! board's textual tokens, which always end in [`TOKEN_DELIMITER`].

use crate::{
   error::{RelayError, Result},
   event::Packet,
};

/// Terminates every textual frame the board sends.
pub const TOKEN_DELIMITER: u8 = b'@';

/// Parses hex text such as `01 0A FF`, `0x01,0x0a` or `010AFF`.
///
/// Tokens are separated by whitespace or commas. A token of one or two
/// digits is one byte; a longer even-length token is a run of bytes.
pub fn parse_hex(text: &str) -> Result<Packet> {
   let mut out = Packet::new();
   for token in text
      .split(|c: char| c.is_whitespace() || c == ',')
      .filter(|t| !t.is_empty())
   {
      let digits = token
         .strip_prefix("0x")
         .or_else(|| token.strip_prefix("0X"))
         .unwrap_or(token);
      if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
         return Err(invalid_hex(token));
      }
      match digits.len() {
         0 => return Err(invalid_hex(token)),
         1 | 2 => out.push(u8::from_str_radix(digits, 16).map_err(|_| invalid_hex(token))?),
         n if n % 2 == 0 => out.extend(hex::decode(digits).map_err(|_| invalid_hex(token))?),
         _ => return Err(invalid_hex(token)),
      }
   }

   if out.is_empty() {
      return Err(RelayError::InvalidInjection("empty hex".into()));
   }
   Ok(out)
}

fn invalid_hex(token: &str) -> RelayError {
   RelayError::InvalidInjection(format!(
      "invalid hex token {token:?} (use: '01 0A FF')"
   ))
}

/// Encodes a board token for the app, appending the delimiter if missing.
pub fn encode_token(text: &str) -> Result<Packet> {
   let text = text.trim();
   if text.is_empty() {
      return Err(RelayError::InvalidInjection("empty token".into()));
   }
   if !text.is_ascii() {
      return Err(RelayError::InvalidInjection(format!(
         "token {text:?} is not ASCII"
      )));
   }

   let mut out = Packet::from_slice(text.as_bytes());
   if out.last() != Some(&TOKEN_DELIMITER) {
      out.push(TOKEN_DELIMITER);
   }
   Ok(out)
}
