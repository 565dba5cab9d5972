//! 流量遥测解码
//! 内核上报的 64 位打包值：高 32 位为上传，低 32 位为下载
//!
//! 每一半的编码：
//! - bit 31..30：单位（0=B, 1=KiB, 2=MiB, 3=GiB）
//! - bit 29..0 ：数值 × 100（保留两位小数）
//!
//! 解码结果截断为整数字节，属于有损量化编码。

use serde::{Deserialize, Serialize};
use std::fmt;

const UNIT_SHIFT: u32 = 30;
const UNIT_MASK: u64 = 0x3;
const MANTISSA_MASK: u64 = 0x3FFF_FFFF;
const HALF_MASK: u64 = 0xFFFF_FFFF;

/// 一次流量采样（字节数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrafficData {
    pub upload: u64,
    pub download: u64,
}

impl TrafficData {
    pub const ZERO: TrafficData = TrafficData {
        upload: 0,
        download: 0,
    };

    /// 从打包值解码
    pub fn from_packed(packed: u64) -> Self {
        let (upload, download) = decode(packed);
        Self { upload, download }
    }

    pub fn total(&self) -> u64 {
        self.upload.saturating_add(self.download)
    }
}

impl fmt::Display for TrafficData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "↑ {} ↓ {}",
            format_bytes(self.upload),
            format_bytes(self.download)
        )
    }
}

/// 解码打包值，返回 (上传字节, 下载字节)
pub fn decode(packed: u64) -> (u64, u64) {
    let upload = decode_half(packed >> 32);
    let download = decode_half(packed & HALF_MASK);
    (upload, download)
}

/// 解码 32 位的一半
fn decode_half(encoded: u64) -> u64 {
    let unit = (encoded >> UNIT_SHIFT) & UNIT_MASK;
    let data = (encoded & MANTISSA_MASK) as f64 / 100.0;

    // 截断而非四舍五入
    match unit {
        0 => data as u64,
        1 => (data * 1024.0) as u64,
        2 => (data * 1024.0 * 1024.0) as u64,
        _ => (data * 1024.0 * 1024.0 * 1024.0) as u64,
    }
}

/// 格式化字节数（1024 进制，两位小数）
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn half(unit: u64, mantissa: u64) -> u64 {
        (unit << UNIT_SHIFT) | (mantissa & MANTISSA_MASK)
    }

    fn pack(upload: u64, download: u64) -> u64 {
        (upload << 32) | download
    }

    #[test]
    fn test_decode_zero() {
        assert_eq!(decode(0), (0, 0));
        assert_eq!(TrafficData::from_packed(0), TrafficData::ZERO);
    }

    #[test]
    fn test_decode_kib_upload() {
        let packed = pack(half(1, 100), 0);
        assert_eq!(decode(packed), (1024, 0));
    }

    #[test]
    fn test_decode_mib_upload() {
        let packed = pack(half(2, 250), 0);
        let (upload, download) = decode(packed);
        assert_eq!(upload, (2.5 * 1024.0 * 1024.0) as u64);
        assert_eq!(upload, 2_621_440);
        assert_eq!(download, 0);
    }

    #[test]
    fn test_decode_download_half() {
        let packed = pack(0, half(3, 150));
        let (upload, download) = decode(packed);
        assert_eq!(upload, 0);
        assert_eq!(download, 1_610_612_736);
    }

    #[test]
    fn test_decode_truncates_fraction() {
        // 1.99 B -> 1
        assert_eq!(decode(pack(half(0, 199), 0)).0, 1);
        // 0.5 KiB -> 512
        assert_eq!(decode(pack(0, half(1, 50))).1, 512);
        // 0.01 KiB -> 10.24 -> 10
        assert_eq!(decode(pack(0, half(1, 1))).1, 10);
    }

    #[test]
    fn test_decode_halves_are_independent() {
        let packed = pack(half(1, 100), half(2, 100));
        let data = TrafficData::from_packed(packed);
        assert_eq!(data.upload, 1024);
        assert_eq!(data.download, 1024 * 1024);
        assert_eq!(data.total(), 1024 + 1024 * 1024);
    }

    #[test]
    fn test_decode_max_mantissa() {
        let packed = pack(half(3, MANTISSA_MASK), 0);
        let (upload, _) = decode(packed);
        let expected = (MANTISSA_MASK as f64 / 100.0 * 1024.0 * 1024.0 * 1024.0) as u64;
        assert_eq!(upload, expected);
    }

    #[test]
    fn test_decode_within_quantization_error() {
        // 12.34 MiB 量化后与原值误差小于 0.01 MiB
        let original = 12.34_f64 * 1024.0 * 1024.0;
        let (upload, _) = decode(pack(half(2, 1234), 0));
        assert!((upload as f64 - original).abs() < 0.01 * 1024.0 * 1024.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(2_621_440), "2.50 MB");
        assert_eq!(format_bytes(1_610_612_736), "1.50 GB");
    }

    #[test]
    fn test_traffic_display() {
        let data = TrafficData {
            upload: 1024,
            download: 512,
        };
        assert_eq!(data.to_string(), "↑ 1.00 KB ↓ 512 B");
    }
}
