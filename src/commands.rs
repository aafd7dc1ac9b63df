//! Assembly of host-facing Kitty graphics commands.
//!
//! Every command leaves through the transmit broker; this module only
//! builds bytes. Outgoing commands carry `q=2` (quiet all responses)
//! unless the config knob disables it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::types::{Compression, ImageFormat, KittyImageInfo};

/// Base64 span per transmitted chunk. All chunks but the last carry `m=1`.
pub const CHUNK_SIZE: usize = 4096;

fn format_value(format: ImageFormat) -> u32 {
    match format {
        ImageFormat::Rgb => 24,
        ImageFormat::Rgba => 32,
        ImageFormat::Png => 100,
        ImageFormat::Gray => 8,
        ImageFormat::GrayAlpha => 16,
    }
}

fn push_quiet(control: &mut String, quiet: bool) {
    if quiet {
        control.push_str(",q=2");
    }
}

/// Build the chunked transmit command stream for one image. The first
/// chunk carries the full control payload; continuations carry only the
/// id and the more-flag.
pub fn transmit_commands(host_id: u32, info: &KittyImageInfo, data: &[u8], quiet: bool) -> Vec<Vec<u8>> {
    let encoded = BASE64.encode(data);
    let chunks: Vec<&[u8]> = if encoded.is_empty() {
        vec![&[]]
    } else {
        encoded.as_bytes().chunks(CHUNK_SIZE).collect()
    };
    let last = chunks.len() - 1;
    let mut out = Vec::with_capacity(chunks.len());
    for (idx, chunk) in chunks.iter().enumerate() {
        let mut control = if idx == 0 {
            let mut c = format!("a=t,f={},i={}", format_value(info.format), host_id);
            if info.format != ImageFormat::Png {
                c.push_str(&format!(",s={},v={}", info.width, info.height));
            }
            if info.compression == Compression::Zlib {
                c.push_str(",o=z");
            }
            push_quiet(&mut c, quiet);
            c
        } else {
            let mut c = format!("i={}", host_id);
            push_quiet(&mut c, quiet);
            c
        };
        control.push_str(if idx == last { ",m=0" } else { ",m=1" });
        out.push(crate::sequences::build_sequence(&control, chunk));
    }
    out
}

/// Geometry of one display fragment, in host coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayGeometry {
    /// Host cell the fragment starts at (0-based).
    pub global_row: u32,
    pub global_col: u32,
    /// Source crop, image pixels.
    pub source_x: u32,
    pub source_y: u32,
    pub source_width: u32,
    pub source_height: u32,
    /// Pixel offset inside the first cell.
    pub x_offset: u32,
    pub y_offset: u32,
    /// Destination size in cells.
    pub columns: u32,
    pub rows: u32,
    pub z: i32,
}

/// Build a display command: cursor save, CUP to the fragment's cell, the
/// placement APC with `C=1` (don't move the cursor), cursor restore.
pub fn display_command(host_id: u32, host_placement: u32, geo: &DisplayGeometry, quiet: bool) -> Vec<u8> {
    let mut control = format!("a=p,i={},p={},C=1", host_id, host_placement);
    if geo.source_width > 0 && geo.source_height > 0 {
        control.push_str(&format!(
            ",x={},y={},w={},h={}",
            geo.source_x, geo.source_y, geo.source_width, geo.source_height
        ));
    }
    if geo.x_offset > 0 || geo.y_offset > 0 {
        control.push_str(&format!(",X={},Y={}", geo.x_offset, geo.y_offset));
    }
    if geo.columns > 0 {
        control.push_str(&format!(",c={}", geo.columns));
    }
    if geo.rows > 0 {
        control.push_str(&format!(",r={}", geo.rows));
    }
    if geo.z != 0 {
        control.push_str(&format!(",z={}", geo.z));
    }
    push_quiet(&mut control, quiet);

    let mut out = Vec::new();
    out.extend_from_slice(b"\x1b7");
    out.extend_from_slice(format!("\x1b[{};{}H", geo.global_row + 1, geo.global_col + 1).as_bytes());
    out.extend_from_slice(&crate::sequences::build_sequence(&control, &[]));
    out.extend_from_slice(b"\x1b8");
    out
}

/// Delete an image and every placement of it on the host.
pub fn delete_image_command(host_id: u32, quiet: bool) -> Vec<u8> {
    let mut control = format!("a=d,d=I,i={}", host_id);
    push_quiet(&mut control, quiet);
    crate::sequences::build_sequence(&control, &[])
}

/// Delete one placement, leaving the image transmitted for reuse.
pub fn delete_placement_command(host_id: u32, host_placement: u32, quiet: bool) -> Vec<u8> {
    let mut control = format!("a=d,d=i,i={},p={}", host_id, host_placement);
    push_quiet(&mut control, quiet);
    crate::sequences::build_sequence(&control, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Compression, ImageFormat, KittyImageInfo};

    fn info(format: ImageFormat, len: usize) -> KittyImageInfo {
        KittyImageInfo {
            id: 1,
            number: 0,
            width: 2,
            height: 2,
            data_length: len,
            format,
            compression: Compression::None,
            implicit_id: false,
            transmit_time: 0,
        }
    }

    #[test]
    fn transmit_single_chunk() {
        let cmds = transmit_commands(9, &info(ImageFormat::Png, 3), b"abc", true);
        assert_eq!(cmds.len(), 1);
        let s = String::from_utf8(cmds[0].clone()).unwrap();
        assert!(s.contains("a=t,f=100,i=9"));
        assert!(s.contains("q=2"));
        assert!(s.contains("m=0"));
        assert!(!s.contains("s=2"));
    }

    #[test]
    fn transmit_chunks_large_payload() {
        // 9000 bytes encode to 12000 base64 chars -> 3 chunks.
        let data = vec![0u8; 9000];
        let cmds = transmit_commands(3, &info(ImageFormat::Rgba, data.len()), &data, true);
        assert_eq!(cmds.len(), 3);
        let first = String::from_utf8(cmds[0].clone()).unwrap();
        let mid = String::from_utf8(cmds[1].clone()).unwrap();
        let last = String::from_utf8(cmds[2].clone()).unwrap();
        assert!(first.contains("s=2,v=2"));
        assert!(first.contains("m=1"));
        assert!(mid.contains("m=1"));
        assert!(!mid.contains("a=t"));
        assert!(last.contains("m=0"));
    }

    #[test]
    fn transmit_roundtrips_payload() {
        use base64::engine::general_purpose::STANDARD as B64;
        use base64::Engine as _;
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let cmds = transmit_commands(1, &info(ImageFormat::Rgb, data.len()), &data, false);
        let mut b64 = Vec::new();
        for cmd in &cmds {
            let body = &cmd[3..cmd.len() - 2];
            let sep = body.iter().position(|&b| b == b';').unwrap();
            b64.extend_from_slice(&body[sep + 1..]);
        }
        assert_eq!(B64.decode(&b64).unwrap(), data);
    }

    #[test]
    fn display_command_frames_with_cursor_save() {
        let geo = DisplayGeometry {
            global_row: 4,
            global_col: 9,
            source_width: 10,
            source_height: 10,
            columns: 5,
            rows: 2,
            ..Default::default()
        };
        let cmd = display_command(7, 11, &geo, true);
        let s = String::from_utf8(cmd).unwrap();
        assert!(s.starts_with("\x1b7\x1b[5;10H"));
        assert!(s.ends_with("\x1b8"));
        assert!(s.contains("a=p,i=7,p=11,C=1"));
        assert!(s.contains("c=5"));
        assert!(s.contains("r=2"));
    }

    #[test]
    fn delete_commands() {
        let s = String::from_utf8(delete_image_command(5, true)).unwrap();
        assert!(s.contains("a=d,d=I,i=5"));
        let s = String::from_utf8(delete_placement_command(5, 2, true)).unwrap();
        assert!(s.contains("a=d,d=i,i=5,p=2"));
    }
}
