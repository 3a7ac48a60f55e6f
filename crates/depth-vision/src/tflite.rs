use anyhow::{Context, Result};
use std::{ffi::CString, os::raw::{c_char, c_int, c_void}, ptr};
use tracing::info;

use crate::decode::RawOutput;
use crate::letterbox::{ScaledImage, TensorLayout};
use crate::model::Model;

#[repr(C)]
struct TfLiteModel;
#[repr(C)]
struct TfLiteInterpreterOptions;
#[repr(C)]
struct TfLiteInterpreter;
#[repr(C)]
struct TfLiteTensor;

#[link(name = "tensorflowlite_c")]
extern "C" {
    fn TfLiteModelCreateFromFile(model_path: *const c_char) -> *mut TfLiteModel;
    fn TfLiteModelDelete(model: *mut TfLiteModel);

    fn TfLiteInterpreterOptionsCreate() -> *mut TfLiteInterpreterOptions;
    fn TfLiteInterpreterOptionsDelete(options: *mut TfLiteInterpreterOptions);
    fn TfLiteInterpreterOptionsSetNumThreads(options: *mut TfLiteInterpreterOptions, num_threads: c_int);

    fn TfLiteInterpreterCreate(model: *const TfLiteModel, options: *const TfLiteInterpreterOptions) -> *mut TfLiteInterpreter;
    fn TfLiteInterpreterDelete(interpreter: *mut TfLiteInterpreter);

    fn TfLiteInterpreterAllocateTensors(interpreter: *mut TfLiteInterpreter) -> c_int;
    fn TfLiteInterpreterInvoke(interpreter: *mut TfLiteInterpreter) -> c_int;

    fn TfLiteInterpreterGetInputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *mut TfLiteTensor;
    fn TfLiteInterpreterGetOutputTensor(interpreter: *mut TfLiteInterpreter, index: c_int) -> *const TfLiteTensor;

    fn TfLiteTensorData(tensor: *const TfLiteTensor) -> *mut c_void;
    fn TfLiteTensorByteSize(tensor: *const TfLiteTensor) -> usize;

    fn TfLiteTensorNumDims(tensor: *const TfLiteTensor) -> c_int;
    fn TfLiteTensorDim(tensor: *const TfLiteTensor, dim_index: c_int) -> c_int;
}

#[derive(Debug, Clone)]
pub struct TfliteConfig {
    pub model_path: String,
    pub threads: i32,
    /// Boxes come out as 0..1 fractions of the input size.
    pub normalized_boxes: bool,
}

/// Float32 NHWC input, `[1, N, 5 + nc]` output (YOLOv5 export layout).
pub struct TfliteModel {
    cfg: TfliteConfig,
    model: *mut TfLiteModel,
    opts: *mut TfLiteInterpreterOptions,
    interp: *mut TfLiteInterpreter,
}

unsafe impl Send for TfliteModel {}

impl TfliteModel {
    pub fn new(cfg: TfliteConfig) -> Result<Self> {
        let cpath = CString::new(cfg.model_path.as_str())?;
        let model = unsafe { TfLiteModelCreateFromFile(cpath.as_ptr()) };
        anyhow::ensure!(!model.is_null(), "failed to load tflite model: {}", cfg.model_path);

        let opts = unsafe { TfLiteInterpreterOptionsCreate() };
        if opts.is_null() {
            unsafe { TfLiteModelDelete(model) };
            anyhow::bail!("failed to create tflite options");
        }
        unsafe { TfLiteInterpreterOptionsSetNumThreads(opts, cfg.threads.max(1)) };

        // from here on Drop releases whatever is non-null
        let mut this = Self { cfg, model, opts, interp: ptr::null_mut() };

        this.interp = unsafe { TfLiteInterpreterCreate(this.model, this.opts) };
        anyhow::ensure!(!this.interp.is_null(), "failed to create tflite interpreter");

        let rc = unsafe { TfLiteInterpreterAllocateTensors(this.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterAllocateTensors failed");

        info!("vision: loaded TFLite model: {}", this.cfg.model_path);
        Ok(this)
    }

    /// Input (height, width) from the `[1, h, w, 3]` input tensor.
    pub fn input_hw(&self) -> Result<(u32, u32)> {
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        match tensor_dims(input).as_slice() {
            [1, h, w, 3] => Ok((*h as u32, *w as u32)),
            other => anyhow::bail!("unexpected input dims {:?}, want [1, h, w, 3]", other),
        }
    }

    pub fn inspect(&mut self) -> Result<String> {
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        anyhow::ensure!(!input.is_null(), "no input tensor");
        let in_dims = tensor_dims(input);
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };

        let out0 = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        anyhow::ensure!(!out0.is_null(), "no output tensor 0");
        let out_dims = tensor_dims(out0);
        let out_bytes = unsafe { TfLiteTensorByteSize(out0) };

        Ok(format!(
            "TFLite inspect:\n- input[0] dims={:?} bytes={}\n- output[0] dims={:?} bytes={}\n",
            in_dims, in_bytes, out_dims, out_bytes
        ))
    }
}

impl Model for TfliteModel {
    fn infer(&mut self, scaled: &ScaledImage) -> Result<RawOutput> {
        let (h, w) = self.input_hw()?;
        anyhow::ensure!(
            (scaled.width(), scaled.height()) == (w, h),
            "model wants {}x{} input, got {}x{}; set letterbox.auto = false for fixed-shape models",
            w, h, scaled.width(), scaled.height()
        );

        let tensor = scaled.to_tensor(TensorLayout::Hwc);
        let input = unsafe { TfLiteInterpreterGetInputTensor(self.interp, 0) };
        let in_bytes = unsafe { TfLiteTensorByteSize(input) };
        let in_ptr = unsafe { TfLiteTensorData(input) as *mut u8 };
        anyhow::ensure!(!in_ptr.is_null(), "null input tensor data");

        let need = tensor.len() * std::mem::size_of::<f32>();
        anyhow::ensure!(in_bytes == need, "input tensor holds {} bytes, frame needs {} (float32 model expected)", in_bytes, need);
        unsafe { ptr::copy_nonoverlapping(tensor.as_ptr() as *const u8, in_ptr, need) };

        let rc = unsafe { TfLiteInterpreterInvoke(self.interp) };
        anyhow::ensure!(rc == 0, "TfLiteInterpreterInvoke failed");

        let out = unsafe { TfLiteInterpreterGetOutputTensor(self.interp, 0) };
        anyhow::ensure!(!out.is_null(), "no output tensor 0");

        let out_dims = tensor_dims(out);
        let (num_preds, stride) = match out_dims.as_slice() {
            [1, n, s] => (*n as usize, *s as usize),
            [n, s] => (*n as usize, *s as usize),
            other => anyhow::bail!("unexpected output dims {:?}. Run `depthscout vision inspect`.", other),
        };
        anyhow::ensure!(stride > 5, "output stride {} leaves no class scores", stride);

        let out_ptr = unsafe { TfLiteTensorData(out) as *const f32 };
        anyhow::ensure!(!out_ptr.is_null(), "null output tensor data");
        let out_len = unsafe { TfLiteTensorByteSize(out) } / std::mem::size_of::<f32>();
        anyhow::ensure!(out_len >= num_preds * stride, "output tensor shorter than its dims");
        let mut data = unsafe { std::slice::from_raw_parts(out_ptr, num_preds * stride) }.to_vec();

        if self.cfg.normalized_boxes {
            let (fw, fh) = (w as f32, h as f32);
            for row in data.chunks_exact_mut(stride) {
                row[0] *= fw;
                row[1] *= fh;
                row[2] *= fw;
                row[3] *= fh;
            }
        }

        RawOutput::new(data, num_preds, stride - 5).context("tflite output")
    }
}

fn tensor_dims(t: *const TfLiteTensor) -> Vec<i32> {
    unsafe {
        let nd = TfLiteTensorNumDims(t);
        let mut v = Vec::with_capacity(nd.max(0) as usize);
        for i in 0..nd { v.push(TfLiteTensorDim(t, i)); }
        v
    }
}

impl Drop for TfliteModel {
    fn drop(&mut self) {
        unsafe {
            if !self.interp.is_null() { TfLiteInterpreterDelete(self.interp); }
            if !self.opts.is_null() { TfLiteInterpreterOptionsDelete(self.opts); }
            if !self.model.is_null() { TfLiteModelDelete(self.model); }
        }
    }
}
