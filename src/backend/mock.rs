//! In-memory backend used by the test suite and for headless runs.
//!
//! Simulates just enough driver behavior for the engine to be exercised
//! end to end: sources hold either one attached static buffer or a queue of
//! streaming buffers, [`MockBackend::advance`] moves playheads forward in
//! simulated time, and every parameter write is counted so tests can assert
//! on commit traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::error::{Result, SonaraError};
use crate::math::Vec3;

use super::{
    Backend, BackendCaps, BufferHandle, ListenerFrame, PcmFormat, SourceHandle, SourceParamB,
    SourceParamF, SourceParamV, SourceState,
};

#[derive(Debug, Default)]
struct MockBuffer {
    frames: usize,
    sample_rate: u32,
    channels: u16,
}

impl MockBuffer {
    fn seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.frames as f64 / self.sample_rate as f64
        }
    }
}

#[derive(Debug)]
struct MockSource {
    state: SourceState,
    attached: Option<u64>,
    queued: VecDeque<u64>,
    processed: Vec<u64>,
    playhead: f64,
    params_f: HashMap<SourceParamF, f32>,
    params_b: HashMap<SourceParamB, bool>,
    params_v: HashMap<SourceParamV, Vec3>,
    writes_f: HashMap<SourceParamF, usize>,
    writes_b: HashMap<SourceParamB, usize>,
    writes_v: HashMap<SourceParamV, usize>,
}

impl MockSource {
    fn new() -> Self {
        Self {
            state: SourceState::Initial,
            attached: None,
            queued: VecDeque::new(),
            processed: Vec::new(),
            playhead: 0.0,
            params_f: HashMap::new(),
            params_b: HashMap::new(),
            params_v: HashMap::new(),
            writes_f: HashMap::new(),
            writes_b: HashMap::new(),
            writes_v: HashMap::new(),
        }
    }

    fn pitch(&self) -> f64 {
        self.params_f.get(&SourceParamF::Pitch).copied().unwrap_or(1.0) as f64
    }

    fn looping(&self) -> bool {
        self.params_b.get(&SourceParamB::Looping).copied().unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct MockInner {
    next_id: u64,
    sources: HashMap<u64, MockSource>,
    buffers: HashMap<u64, MockBuffer>,
    listener: Option<ListenerFrame>,
    device_resets: usize,
}

impl MockInner {
    fn source(&mut self, handle: SourceHandle) -> Result<&mut MockSource> {
        self.sources
            .get_mut(&handle.0)
            .ok_or_else(|| SonaraError::Backend(format!("unknown source {:?}", handle)))
    }

    fn advance_source(source: &mut MockSource, buffers: &HashMap<u64, MockBuffer>, dt: f64) {
        if source.state != SourceState::Playing {
            return;
        }
        let mut remaining = dt * source.pitch();

        if let Some(attached) = source.attached {
            let seconds = buffers.get(&attached).map(|b| b.seconds()).unwrap_or(0.0);
            if seconds <= 0.0 {
                return;
            }
            source.playhead += remaining;
            if source.playhead >= seconds {
                if source.looping() {
                    source.playhead %= seconds;
                } else {
                    source.state = SourceState::Stopped;
                    source.playhead = 0.0;
                }
            }
            return;
        }

        // Streaming queue: consume whole buffers as time passes.
        while remaining > 0.0 {
            let Some(&front) = source.queued.front() else {
                // Ran out of queued data: underrun.
                source.state = SourceState::Stopped;
                source.playhead = 0.0;
                return;
            };
            let seconds = buffers.get(&front).map(|b| b.seconds()).unwrap_or(0.0);
            let left = seconds - source.playhead;
            if remaining >= left {
                remaining -= left;
                source.playhead = 0.0;
                source.queued.pop_front();
                source.processed.push(front);
            } else {
                source.playhead += remaining;
                remaining = 0.0;
            }
        }
    }
}

/// Cloneable mock driver; all clones share one simulated device, so a test
/// can keep a probe clone while the engine owns its `Box<dyn Backend>`.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<MockInner>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance simulated playback by `dt` seconds.
    pub fn advance(&self, dt: f64) {
        let mut inner = self.inner.lock().unwrap();
        let buffers = std::mem::take(&mut inner.buffers);
        for source in inner.sources.values_mut() {
            MockInner::advance_source(source, &buffers, dt);
        }
        inner.buffers = buffers;
    }

    pub fn source_count(&self) -> usize {
        self.inner.lock().unwrap().sources.len()
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.lock().unwrap().buffers.len()
    }

    pub fn device_resets(&self) -> usize {
        self.inner.lock().unwrap().device_resets
    }

    pub fn listener_frame(&self) -> Option<ListenerFrame> {
        self.inner.lock().unwrap().listener
    }

    pub fn all_sources(&self) -> Vec<SourceHandle> {
        self.inner
            .lock()
            .unwrap()
            .sources
            .keys()
            .map(|id| SourceHandle(*id))
            .collect()
    }

    /// Total buffers held by any source, queued or processed.
    pub fn total_buffers_on_sources(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sources
            .values()
            .map(|s| s.queued.len() + s.processed.len())
            .sum()
    }

    pub fn state_of(&self, source: SourceHandle) -> Option<SourceState> {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .map(|s| s.state)
    }

    pub fn playhead_of(&self, source: SourceHandle) -> Option<f64> {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .map(|s| s.playhead)
    }

    /// Buffers currently held by the source: queued plus processed-but-not-
    /// unqueued. Used by the streaming conservation checks.
    pub fn buffers_on_source(&self, source: SourceHandle) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .map(|s| s.queued.len() + s.processed.len())
            .unwrap_or(0)
    }

    pub fn f32_param(&self, source: SourceHandle, param: SourceParamF) -> Option<f32> {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .and_then(|s| s.params_f.get(&param).copied())
    }

    pub fn bool_param(&self, source: SourceHandle, param: SourceParamB) -> Option<bool> {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .and_then(|s| s.params_b.get(&param).copied())
    }

    pub fn vec3_param(&self, source: SourceHandle, param: SourceParamV) -> Option<Vec3> {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .and_then(|s| s.params_v.get(&param).copied())
    }

    pub fn vec3_writes(&self, source: SourceHandle, param: SourceParamV) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .and_then(|s| s.writes_v.get(&param).copied())
            .unwrap_or(0)
    }

    pub fn f32_writes(&self, source: SourceHandle, param: SourceParamF) -> usize {
        self.inner
            .lock()
            .unwrap()
            .sources
            .get(&source.0)
            .and_then(|s| s.writes_f.get(&param).copied())
            .unwrap_or(0)
    }
}

impl Backend for MockBackend {
    fn device_name(&self) -> String {
        "Sonara Mock Device".to_string()
    }

    fn enumerate_devices(&self) -> Vec<String> {
        vec![self.device_name()]
    }

    fn reset_device(&mut self, _device: Option<&str>) -> Result<()> {
        self.inner.lock().unwrap().device_resets += 1;
        Ok(())
    }

    fn capabilities(&self) -> BackendCaps {
        BackendCaps {
            spatialization: true,
            direct_channels: true,
            hrtf: false,
        }
    }

    fn create_sources(&mut self, count: usize) -> Result<Vec<SourceHandle>> {
        let mut inner = self.inner.lock().unwrap();
        let mut handles = Vec::with_capacity(count);
        for _ in 0..count {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.sources.insert(id, MockSource::new());
            handles.push(SourceHandle(id));
        }
        Ok(handles)
    }

    fn destroy_sources(&mut self, sources: &[SourceHandle]) {
        let mut inner = self.inner.lock().unwrap();
        for handle in sources {
            inner.sources.remove(&handle.0);
        }
    }

    fn create_buffer(&mut self) -> Result<BufferHandle> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.buffers.insert(id, MockBuffer::default());
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.inner.lock().unwrap().buffers.remove(&buffer.0);
    }

    fn upload(&mut self, buffer: BufferHandle, format: &PcmFormat, data: &[f32]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| SonaraError::Backend(format!("unknown buffer {:?}", buffer)))?;
        slot.frames = data.len() / format.channels.max(1) as usize;
        slot.sample_rate = format.sample_rate;
        slot.channels = format.channels;
        Ok(())
    }

    fn set_source_f32(
        &mut self,
        source: SourceHandle,
        param: SourceParamF,
        value: f32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        src.params_f.insert(param, value);
        *src.writes_f.entry(param).or_insert(0) += 1;
        Ok(())
    }

    fn set_source_bool(
        &mut self,
        source: SourceHandle,
        param: SourceParamB,
        value: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        src.params_b.insert(param, value);
        *src.writes_b.entry(param).or_insert(0) += 1;
        Ok(())
    }

    fn set_source_vec3(
        &mut self,
        source: SourceHandle,
        param: SourceParamV,
        value: Vec3,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        src.params_v.insert(param, value);
        *src.writes_v.entry(param).or_insert(0) += 1;
        Ok(())
    }

    fn get_source_f32(&mut self, source: SourceHandle, param: SourceParamF) -> Result<f32> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        Ok(src.params_f.get(&param).copied().unwrap_or(match param {
            SourceParamF::Gain | SourceParamF::Pitch | SourceParamF::RolloffFactor => 1.0,
            SourceParamF::ReferenceDistance => 1.0,
            SourceParamF::MaxDistance => f32::MAX,
        }))
    }

    fn attach_buffer(&mut self, source: SourceHandle, buffer: Option<BufferHandle>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        src.attached = buffer.map(|b| b.0);
        if buffer.is_none() {
            src.playhead = 0.0;
        }
        Ok(())
    }

    fn queue_buffer(&mut self, source: SourceHandle, buffer: BufferHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        src.queued.push_back(buffer.0);
        Ok(())
    }

    fn unqueue_processed(&mut self, source: SourceHandle) -> Result<Vec<BufferHandle>> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        Ok(src.processed.drain(..).map(BufferHandle).collect())
    }

    fn queued_count(&mut self, source: SourceHandle) -> Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.source(source)?.queued.len())
    }

    fn play(&mut self, source: SourceHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.source(source)?.state = SourceState::Playing;
        Ok(())
    }

    fn pause(&mut self, source: SourceHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.source(source)?.state = SourceState::Paused;
        Ok(())
    }

    fn stop(&mut self, source: SourceHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        src.state = SourceState::Stopped;
        src.playhead = 0.0;
        // Stopping marks all queued data as processed, like the driver does.
        let drained: Vec<u64> = src.queued.drain(..).collect();
        src.processed.extend(drained);
        Ok(())
    }

    fn rewind(&mut self, source: SourceHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let src = inner.source(source)?;
        src.state = SourceState::Initial;
        src.playhead = 0.0;
        Ok(())
    }

    fn source_state(&mut self, source: SourceHandle) -> Result<SourceState> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.source(source)?.state)
    }

    fn playhead(&mut self, source: SourceHandle) -> Result<f64> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.source(source)?.playhead)
    }

    fn seek(&mut self, source: SourceHandle, seconds: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.source(source)?.playhead = seconds.max(0.0);
        Ok(())
    }

    fn set_listener(&mut self, frame: &ListenerFrame) -> Result<()> {
        self.inner.lock().unwrap().listener = Some(*frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_playback_stops_at_end() {
        let mut backend = MockBackend::new();
        let source = backend.create_sources(1).unwrap()[0];
        let buffer = backend.create_buffer().unwrap();
        backend
            .upload(buffer, &PcmFormat::float(1, 1000), &vec![0.0; 1000])
            .unwrap();
        backend.attach_buffer(source, Some(buffer)).unwrap();
        backend.play(source).unwrap();

        backend.advance(0.5);
        assert_eq!(backend.state_of(source), Some(SourceState::Playing));
        assert!((backend.playhead_of(source).unwrap() - 0.5).abs() < 1e-9);

        backend.advance(0.6);
        assert_eq!(backend.state_of(source), Some(SourceState::Stopped));
    }

    #[test]
    fn test_looping_static_wraps() {
        let mut backend = MockBackend::new();
        let source = backend.create_sources(1).unwrap()[0];
        let buffer = backend.create_buffer().unwrap();
        backend
            .upload(buffer, &PcmFormat::float(1, 1000), &vec![0.0; 1000])
            .unwrap();
        backend.attach_buffer(source, Some(buffer)).unwrap();
        backend
            .set_source_bool(source, SourceParamB::Looping, true)
            .unwrap();
        backend.play(source).unwrap();

        backend.advance(1.25);
        assert_eq!(backend.state_of(source), Some(SourceState::Playing));
        assert!((backend.playhead_of(source).unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_streaming_queue_consumption() {
        let mut backend = MockBackend::new();
        let source = backend.create_sources(1).unwrap()[0];
        let format = PcmFormat::float(1, 1000);
        let a = backend.create_buffer().unwrap();
        let b = backend.create_buffer().unwrap();
        backend.upload(a, &format, &vec![0.0; 500]).unwrap();
        backend.upload(b, &format, &vec![0.0; 500]).unwrap();
        backend.queue_buffer(source, a).unwrap();
        backend.queue_buffer(source, b).unwrap();
        backend.play(source).unwrap();

        backend.advance(0.75);
        assert_eq!(backend.unqueue_processed(source).unwrap(), vec![a]);
        assert_eq!(backend.queued_count(source).unwrap(), 1);

        // Exhausting the queue is an underrun: the source stops.
        backend.advance(0.5);
        assert_eq!(backend.state_of(source), Some(SourceState::Stopped));
    }
}
