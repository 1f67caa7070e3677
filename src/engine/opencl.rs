//! OpenCL implementation of the search device port.
//!
//! Owns the context, queue and the four storage buffers. The kernel
//! pipeline is rebuilt from the registry's source whenever the algorithm
//! changes; midstate and target rewrites reuse it in place.

use std::ptr;

use opencl3::command_queue::CommandQueue;
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_GPU};
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_uint, CL_BLOCKING};

use crate::algo::{AlgoSpec, Algorithm, Midstate, Target};
use crate::engine::{DeviceError, DeviceInfo, ResultSlot, SearchDevice};

/// Words per result slot: nonce_lo, hash_w0, hash_w1, flag.
const SLOT_WORDS: usize = 4;

pub struct OpenClDevice {
    context: Context,
    queue: CommandQueue,
    pipeline: Option<Pipeline>,
    info: DeviceInfo,
}

struct Pipeline {
    algorithm: Algorithm,
    kernel: Kernel,
    midstate_buf: Buffer<cl_uint>,
    target_buf: Buffer<cl_uint>,
    results_buf: Buffer<cl_uint>,
    offset_buf: Buffer<cl_uint>,
    workgroup_size: u32,
    result_slots: usize,
}

/// Enumerate GPU devices across all platforms.
pub fn detect_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    let platforms = get_platforms()
        .map_err(|e| DeviceError::Unavailable(format!("failed to get platforms: {:?}", e)))?;
    if platforms.is_empty() {
        return Err(DeviceError::Unavailable("no OpenCL platforms found".to_string()));
    }

    let mut infos = Vec::new();
    for platform in platforms {
        let device_ids = platform
            .get_devices(CL_DEVICE_TYPE_GPU)
            .map_err(|e| DeviceError::Unavailable(format!("failed to get devices: {:?}", e)))?;
        for id in device_ids {
            let device = Device::new(id);
            if let Ok(info) = device_info(&device) {
                infos.push(info);
            }
        }
    }
    if infos.is_empty() {
        return Err(DeviceError::Unavailable("no GPU devices found".to_string()));
    }
    Ok(infos)
}

fn device_info(device: &Device) -> Result<DeviceInfo, DeviceError> {
    Ok(DeviceInfo {
        name: device
            .name()
            .map_err(|e| DeviceError::Unavailable(format!("device name: {:?}", e)))?,
        compute_units: device
            .max_compute_units()
            .map_err(|e| DeviceError::Unavailable(format!("compute units: {:?}", e)))?,
        max_workgroup_size: device
            .max_work_group_size()
            .map_err(|e| DeviceError::Unavailable(format!("workgroup size: {:?}", e)))?,
    })
}

impl OpenClDevice {
    /// Open the `index`-th GPU device.
    pub fn new(index: usize) -> Result<Self, DeviceError> {
        let platforms = get_platforms()
            .map_err(|e| DeviceError::Unavailable(format!("failed to get platforms: {:?}", e)))?;

        let mut flat = Vec::new();
        for platform in platforms {
            if let Ok(ids) = platform.get_devices(CL_DEVICE_TYPE_GPU) {
                flat.extend(ids);
            }
        }
        let id = *flat
            .get(index)
            .ok_or_else(|| DeviceError::Unavailable(format!("device {} not found", index)))?;
        let device = Device::new(id);
        let info = device_info(&device)?;

        let context = Context::from_device(&device)
            .map_err(|e| DeviceError::Unavailable(format!("context: {:?}", e)))?;
        let queue = CommandQueue::create_default(&context, 0)
            .map_err(|e| DeviceError::Unavailable(format!("queue: {:?}", e)))?;

        tracing::info!(name = %info.name, compute_units = info.compute_units, "opened OpenCL device");

        Ok(OpenClDevice { context, queue, pipeline: None, info })
    }

    fn build_pipeline(&mut self, spec: &AlgoSpec) -> Result<(), DeviceError> {
        tracing::info!(algorithm = %spec.algorithm, "compiling device kernel");
        let program =
            Program::create_and_build_from_source(&self.context, spec.kernel_source, "")
                .map_err(|e| DeviceError::Build(format!("kernel build: {}", e)))?;
        let kernel = Kernel::create(&program, spec.kernel_name)
            .map_err(|e| DeviceError::Build(format!("kernel create: {:?}", e)))?;

        let result_slots = spec.result_slots as usize;
        let midstate_words = spec.midstate_len / 4;
        let target_words = spec.algorithm.target_format().word_count();

        let midstate_buf = unsafe {
            Buffer::<cl_uint>::create(&self.context, CL_MEM_READ_ONLY, midstate_words, ptr::null_mut())
        }
        .map_err(|e| DeviceError::Build(format!("midstate buffer: {:?}", e)))?;
        let target_buf = unsafe {
            Buffer::<cl_uint>::create(&self.context, CL_MEM_READ_ONLY, target_words, ptr::null_mut())
        }
        .map_err(|e| DeviceError::Build(format!("target buffer: {:?}", e)))?;
        let results_buf = unsafe {
            Buffer::<cl_uint>::create(
                &self.context,
                CL_MEM_READ_WRITE,
                1 + SLOT_WORDS * result_slots,
                ptr::null_mut(),
            )
        }
        .map_err(|e| DeviceError::Build(format!("results buffer: {:?}", e)))?;
        let offset_buf = unsafe {
            Buffer::<cl_uint>::create(&self.context, CL_MEM_READ_ONLY, 1, ptr::null_mut())
        }
        .map_err(|e| DeviceError::Build(format!("offset buffer: {:?}", e)))?;

        let workgroup_size = (spec.workgroup_size as usize).min(self.info.max_workgroup_size) as u32;

        self.pipeline = Some(Pipeline {
            algorithm: spec.algorithm,
            kernel,
            midstate_buf,
            target_buf,
            results_buf,
            offset_buf,
            workgroup_size,
            result_slots,
        });
        Ok(())
    }

}

impl SearchDevice for OpenClDevice {
    fn configure(
        &mut self,
        spec: &AlgoSpec,
        midstate: &Midstate,
        target: &Target,
    ) -> Result<(), DeviceError> {
        let rebuild = self
            .pipeline
            .as_ref()
            .map(|p| p.algorithm != spec.algorithm)
            .unwrap_or(true);
        if rebuild {
            self.build_pipeline(spec)?;
        }

        let midstate_words = midstate.device_words();
        let target_words = target.device_words();
        let queue = &self.queue;
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| DeviceError::Build("pipeline missing after build".to_string()))?;

        unsafe {
            queue
                .enqueue_write_buffer(&mut pipeline.midstate_buf, CL_BLOCKING, 0, &midstate_words, &[])
                .map_err(|e| DeviceError::Dispatch(format!("midstate write: {:?}", e)))?;
            queue
                .enqueue_write_buffer(&mut pipeline.target_buf, CL_BLOCKING, 0, &target_words, &[])
                .map_err(|e| DeviceError::Dispatch(format!("target write: {:?}", e)))?;
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        nonce_hi: u32,
        nonce_offset: u32,
        workgroups: u32,
    ) -> Result<Vec<ResultSlot>, DeviceError> {
        let queue = &self.queue;
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| DeviceError::Dispatch("dispatch before configure".to_string()))?;

        let zero = [0u32];
        let offset = [nonce_offset];
        unsafe {
            queue
                .enqueue_write_buffer(&mut pipeline.results_buf, CL_BLOCKING, 0, &zero, &[])
                .map_err(|e| DeviceError::Dispatch(format!("counter reset: {:?}", e)))?;
            queue
                .enqueue_write_buffer(&mut pipeline.offset_buf, CL_BLOCKING, 0, &offset, &[])
                .map_err(|e| DeviceError::Dispatch(format!("offset write: {:?}", e)))?;
        }

        let local = pipeline.workgroup_size as usize;
        let global = local * workgroups as usize;

        let event = unsafe {
            ExecuteKernel::new(&pipeline.kernel)
                .set_arg(&pipeline.midstate_buf)
                .set_arg(&pipeline.target_buf)
                .set_arg(&pipeline.results_buf)
                .set_arg(&pipeline.offset_buf)
                .set_arg(&nonce_hi)
                .set_global_work_size(global)
                .set_local_work_size(local)
                .enqueue_nd_range(queue)
                .map_err(|e| DeviceError::Dispatch(format!("kernel launch: {:?}", e)))?
        };
        event
            .wait()
            .map_err(|e| DeviceError::Dispatch(format!("queue wait: {:?}", e)))?;

        let mut readback = vec![0u32; 1 + SLOT_WORDS * pipeline.result_slots];
        unsafe {
            queue
                .enqueue_read_buffer(&pipeline.results_buf, CL_BLOCKING, 0, &mut readback, &[])
                .map_err(|e| DeviceError::Dispatch(format!("results read: {:?}", e)))?;
        }

        let count = (readback[0] as usize).min(pipeline.result_slots);
        let mut slots = Vec::with_capacity(count);
        for i in 0..count {
            let base = 1 + SLOT_WORDS * i;
            if readback[base + 3] == 1 {
                slots.push(ResultSlot {
                    nonce_lo: readback[base],
                    hash_w0: readback[base + 1],
                    hash_w1: readback[base + 2],
                });
            }
        }
        Ok(slots)
    }

    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }
}
