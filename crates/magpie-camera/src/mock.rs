//! Mock 相机后端
//!
//! 测试替身：帧内容为确定性填充，抓帧延迟与失速窗口由脚本控制，
//! 用于验证录制环的偏差窗口与降级策略。

use crate::provider::{CameraBackend, CameraProvider, ScanLimits};
use crate::{CameraDescriptor, CameraError, CameraKind, Frame, PixelFormat};
use magpie_store::timestamp::monotonic_us;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 单路 Mock 相机的行为脚本
#[derive(Debug)]
pub struct MockCameraScript {
    /// 深度相机有序列号；通用相机为 `None`
    pub serial: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// 每次抓帧的耗时
    pub grab_latency: Duration,
    /// 从第 N 帧开始失速（抓帧一律超时），`None` 表示不失速
    pub stall_from_sequence: Option<u64>,
    /// 失速持续的帧数（之后恢复）；0 表示永久失速
    pub stall_frames: u64,
}

impl Default for MockCameraScript {
    fn default() -> Self {
        Self {
            serial: None,
            width: 8,
            height: 8,
            fps: 30,
            grab_latency: Duration::ZERO,
            stall_from_sequence: None,
            stall_frames: 0,
        }
    }
}

impl MockCameraScript {
    pub fn depth(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            ..Default::default()
        }
    }
}

/// Mock 相机发现（一组脚本 = 一组"插着的"相机）
pub struct MockCameraProvider {
    scripts: Vec<Arc<Mutex<MockCameraScript>>>,
    kind: CameraKind,
}

impl MockCameraProvider {
    pub fn generic(count: usize) -> Self {
        Self {
            scripts: (0..count)
                .map(|_| Arc::new(Mutex::new(MockCameraScript::default())))
                .collect(),
            kind: CameraKind::GenericIndex,
        }
    }

    pub fn depth(serials: &[&str]) -> Self {
        Self {
            scripts: serials
                .iter()
                .map(|s| Arc::new(Mutex::new(MockCameraScript::depth(*s))))
                .collect(),
            kind: CameraKind::DepthSensor,
        }
    }

    /// 第 i 路相机的脚本句柄（测试侧随时修改）
    pub fn script(&self, index: usize) -> Arc<Mutex<MockCameraScript>> {
        Arc::clone(&self.scripts[index])
    }
}

impl CameraProvider for MockCameraProvider {
    fn name(&self) -> &'static str {
        match self.kind {
            CameraKind::GenericIndex => "mock-generic",
            CameraKind::DepthSensor => "mock-depth",
        }
    }

    fn enumerate(&self, limits: &ScanLimits) -> Vec<CameraDescriptor> {
        self.scripts
            .iter()
            .take(match self.kind {
                // 通用相机同样受 max_index 约束；深度相机走 SDK 列表，不受限
                CameraKind::GenericIndex => limits.max_index as usize,
                CameraKind::DepthSensor => usize::MAX,
            })
            .enumerate()
            .map(|(i, script)| {
                let script = script.lock().unwrap();
                CameraDescriptor {
                    kind: self.kind,
                    identifier: script
                        .serial
                        .clone()
                        .unwrap_or_else(|| format!("camera-{}", i)),
                    index: Some(i as u32),
                    serial_number: script.serial.clone(),
                }
            })
            .collect()
    }

    fn open(&self, descriptor: &CameraDescriptor) -> Result<Box<dyn CameraBackend>, CameraError> {
        let index = descriptor
            .index
            .ok_or_else(|| CameraError::NotFound(descriptor.identifier.clone()))?
            as usize;
        let script = self
            .scripts
            .get(index)
            .ok_or_else(|| CameraError::NotFound(descriptor.identifier.clone()))?;

        Ok(Box::new(MockCamera {
            identifier: descriptor.identifier.clone(),
            serial: descriptor.serial_number.clone(),
            script: Arc::clone(script),
            sequence: 0,
            open: true,
        }))
    }
}

/// 一条已打开的 Mock 流
pub struct MockCamera {
    identifier: String,
    serial: Option<String>,
    script: Arc<Mutex<MockCameraScript>>,
    sequence: u64,
    open: bool,
}

impl CameraBackend for MockCamera {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn serial_number(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn resolution(&self) -> (u32, u32) {
        let script = self.script.lock().unwrap();
        (script.width, script.height)
    }

    fn fps(&self) -> u32 {
        self.script.lock().unwrap().fps
    }

    fn grab(&mut self, _timeout: Duration) -> Result<Frame, CameraError> {
        if !self.open {
            return Err(CameraError::Closed);
        }
        let (latency, stalled, width, height) = {
            let script = self.script.lock().unwrap();
            let next = self.sequence + 1;
            let stalled = match script.stall_from_sequence {
                Some(from) if next >= from => {
                    script.stall_frames == 0 || next < from + script.stall_frames
                }
                _ => false,
            };
            (script.grab_latency, stalled, script.width, script.height)
        };

        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
        if stalled {
            self.sequence += 1; // 失速也消耗序号，恢复点可预测
            return Err(CameraError::Timeout);
        }

        self.sequence += 1;
        let pixel = (self.sequence % 256) as u8;
        Ok(Frame::new(
            vec![pixel; (width * height) as usize],
            width,
            height,
            PixelFormat::Rgb8,
            monotonic_us(),
            self.sequence,
        ))
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
