//! Raw camera buffers to 8-bit grayscale.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("invalid {format} length: expected {expected}, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("MJPEG decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("MJPEG frame is {actual_w}x{actual_h}, stream is {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        actual_w: u32,
        actual_h: u32,
    },
}

/// A grayscale image straight off the camera, before it becomes a `Frame`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawGray {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

fn check_len(
    format: &'static str,
    buf: &[u8],
    expected: usize,
) -> Result<(), ConvertError> {
    if buf.len() < expected {
        return Err(ConvertError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let expected = (width * height * 2) as usize;
    check_len("YUYV", yuyv, expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

pub fn grey_copy(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = (width * height) as usize;
    check_len("GREY", buf, pixels)?;
    Ok(buf[..pixels].to_vec())
}

/// 16-bit little-endian grayscale, keeping the high byte.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let pixels = (width * height) as usize;
    check_len("Y16", buf, pixels * 2)?;
    Ok(buf[..pixels * 2]
        .chunks_exact(2)
        .map(|px| px[1])
        .collect())
}

pub fn mjpeg_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, ConvertError> {
    let decoded = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)?;
    let gray = decoded.to_luma8();
    if gray.dimensions() != (width, height) {
        return Err(ConvertError::SizeMismatch {
            width,
            height,
            actual_w: gray.width(),
            actual_h: gray.height(),
        });
    }
    Ok(gray.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        assert_eq!(yuyv_to_grayscale(&yuyv, 2, 1).unwrap(), vec![100, 200]);
    }

    #[test]
    fn test_yuyv_to_grayscale_4x2() {
        let yuyv: Vec<u8> = (0..16).collect();
        let gray = yuyv_to_grayscale(&yuyv, 4, 2).unwrap();
        assert_eq!(gray, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert!(matches!(
            yuyv_to_grayscale(&[100, 128], 2, 1),
            Err(ConvertError::InvalidLength { format: "YUYV", expected: 4, actual: 2 })
        ));
        assert!(grey_copy(&[1, 2, 3], 2, 2).is_err());
        assert!(y16_to_grayscale(&[0; 7], 2, 2).is_err());
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x1234 and 0xFF00, little-endian
        let buf = vec![0x34, 0x12, 0x00, 0xFF];
        assert_eq!(y16_to_grayscale(&buf, 2, 1).unwrap(), vec![0x12, 0xFF]);
    }

    #[test]
    fn test_mjpeg_roundtrip_size() {
        let img = image::GrayImage::from_pixel(8, 4, image::Luma([90u8]));
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let gray = mjpeg_to_grayscale(&jpeg, 8, 4).unwrap();
        assert_eq!(gray.len(), 32);
        assert!(gray.iter().all(|&p| (p as i32 - 90).abs() <= 2));
        assert!(matches!(
            mjpeg_to_grayscale(&jpeg, 16, 4),
            Err(ConvertError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_mjpeg_garbage_is_error() {
        assert!(mjpeg_to_grayscale(&[0, 1, 2, 3], 2, 2).is_err());
    }
}
