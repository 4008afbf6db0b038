//! Frame records as they appear in the log and the live feed.

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use strum::{AsRefStr, Display};

/// Which way a frame crossed the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum Direction {
   #[serde(rename = "app->board")]
   #[strum(serialize = "app->board")]
   AppToBoard,
   #[serde(rename = "board->app")]
   #[strum(serialize = "board->app")]
   BoardToApp,
}

/// Whether a frame was seen on the air or typed in by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum Origin {
   #[serde(rename = "ble")]
   #[strum(serialize = "ble")]
   Observed,
   #[serde(rename = "manual")]
   #[strum(serialize = "manual")]
   Injected,
}

/// A logged frame.
///
/// Everything except `comment` is fixed at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
   pub id: SmolStr,
   /// Milliseconds since the Unix epoch.
   pub ms: u64,
   pub dir: Direction,
   pub kind: Origin,
   pub hex: String,
   pub ascii: String,
   #[serde(default)]
   pub comment: String,
}

impl FrameRecord {
   pub fn new(
      id: SmolStr,
      ms: u64,
      dir: Direction,
      kind: Origin,
      payload: &[u8],
      comment: &str,
   ) -> Self {
      Self {
         id,
         ms,
         dir,
         kind,
         hex: spaced_hex(payload),
         ascii: ascii_projection(payload),
         comment: comment.to_string(),
      }
   }
}

/// Formats bytes as upper-case hex pairs separated by single spaces.
pub fn spaced_hex(payload: &[u8]) -> String {
   let packed = hex::encode_upper(payload);
   let mut out = String::with_capacity(packed.len() + payload.len());
   for (i, pair) in packed.as_bytes().chunks(2).enumerate() {
      if i > 0 {
         out.push(' ');
      }
      out.push(pair[0] as char);
      out.push(pair[1] as char);
   }
   out
}

/// Printable ASCII is kept, everything else becomes `.`.
pub fn ascii_projection(payload: &[u8]) -> String {
   payload
      .iter()
      .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
      .collect()
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_spaced_hex() {
      assert_eq!(spaced_hex(&[0x01, 0x0a, 0xff]), "01 0A FF");
      assert_eq!(spaced_hex(&[0x42]), "42");
      assert_eq!(spaced_hex(&[]), "");
   }

   #[test]
   fn test_ascii_projection() {
      assert_eq!(ascii_projection(b"OUT@"), "OUT@");
      assert_eq!(ascii_projection(&[0x00, b'A', 0x7f, b' ', 0x80]), ".A. .");
   }

   #[test]
   fn test_record_wire_format() {
      let record = FrameRecord::new(
         SmolStr::new_static("1-1-1"),
         1_700_000_000_000,
         Direction::BoardToApp,
         Origin::Observed,
         b"S3@",
         "",
      );
      let json = serde_json::to_value(&record).unwrap();
      assert_eq!(json["dir"], "board->app");
      assert_eq!(json["kind"], "ble");
      assert_eq!(json["hex"], "53 33 40");
      assert_eq!(json["ascii"], "S3@");
      assert_eq!(json["comment"], "");
   }

   #[test]
   fn test_direction_display_matches_wire() {
      assert_eq!(Direction::AppToBoard.to_string(), "app->board");
      assert_eq!(Origin::Injected.as_ref(), "manual");
   }
}
