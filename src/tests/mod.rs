mod engine_ops;
mod multi_device;
