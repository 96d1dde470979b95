//! V4L2 通用相机后端（仅 Linux，`v4l2` feature）
//!
//! 按索引探测 `/dev/video0..N`。V4L2 不提供可靠的设备序列号查询，
//! 因此通用相机的标识退化为 `camera-<index>`，由操作者保证索引与
//! 物理机位的对应关系稳定。

use crate::provider::{CameraBackend, CameraProvider, ScanLimits};
use crate::{CameraDescriptor, CameraError, CameraKind, Frame, PixelFormat};
use magpie_store::timestamp::monotonic_us;
use std::time::Duration;
use tracing::{debug, trace, warn};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;

/// V4L2 相机发现
pub struct V4lProvider;

impl CameraProvider for V4lProvider {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&self, limits: &ScanLimits) -> Vec<CameraDescriptor> {
        let mut descriptors = Vec::new();
        for index in 0..limits.max_index {
            let dev = match Device::new(index as usize) {
                Ok(dev) => dev,
                Err(_) => {
                    trace!(index, "no V4L2 device at index");
                    continue;
                }
            };
            let caps = match dev.query_caps() {
                Ok(caps) => caps,
                Err(e) => {
                    warn!(index, error = %e, "V4L2 capability query failed, skipping");
                    continue;
                }
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                trace!(index, "V4L2 node is not a capture device");
                continue;
            }
            descriptors.push(CameraDescriptor {
                kind: CameraKind::GenericIndex,
                identifier: format!("camera-{}", index),
                index: Some(index),
                serial_number: None,
            });
        }
        debug!(count = descriptors.len(), "V4L2 enumeration complete");
        descriptors
    }

    fn open(&self, descriptor: &CameraDescriptor) -> Result<Box<dyn CameraBackend>, CameraError> {
        let index = descriptor
            .index
            .ok_or_else(|| CameraError::NotFound(descriptor.identifier.clone()))?;

        let dev = Device::new(index as usize)
            .map_err(|e| CameraError::Backend(format!("open /dev/video{}: {}", index, e)))?;

        let format = dev
            .format()
            .map_err(|e| CameraError::Backend(format!("query format: {}", e)))?;
        let fps = dev
            .params()
            .ok()
            .map(|p| {
                if p.interval.numerator == 0 {
                    30
                } else {
                    p.interval.denominator / p.interval.numerator
                }
            })
            .unwrap_or(30);

        let pixel_format = match &format.fourcc.repr {
            b"MJPG" => PixelFormat::Mjpeg,
            _ => PixelFormat::Rgb8,
        };

        let stream = MmapStream::with_buffers(&dev, Type::VideoCapture, 4)
            .map_err(|e| CameraError::Backend(format!("map capture buffers: {}", e)))?;

        debug!(index, width = format.width, height = format.height, fps, "V4L2 stream opened");
        Ok(Box::new(V4lCamera {
            identifier: descriptor.identifier.clone(),
            stream: Some(stream),
            width: format.width,
            height: format.height,
            fps,
            pixel_format,
            sequence: 0,
        }))
    }
}

/// 一条已打开的 V4L2 流
pub struct V4lCamera {
    identifier: String,
    stream: Option<MmapStream<'static>>,
    width: u32,
    height: u32,
    fps: u32,
    pixel_format: PixelFormat,
    sequence: u64,
}

impl CameraBackend for V4lCamera {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn serial_number(&self) -> Option<&str> {
        None
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    /// V4L2 的出队调用没有独立超时参数，阻塞时长受驱动帧周期限制；
    /// 抓帧在专属工作线程里执行，不会出现在录制环路径上。
    fn grab(&mut self, _timeout: Duration) -> Result<Frame, CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::Closed)?;
        let (buffer, _meta) = stream.next().map_err(CameraError::Io)?;

        self.sequence += 1;
        Ok(Frame::new(
            buffer.to_vec(),
            self.width,
            self.height,
            self.pixel_format,
            monotonic_us(),
            self.sequence,
        ))
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
