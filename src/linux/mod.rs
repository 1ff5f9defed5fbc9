pub mod cpu_info;
pub mod kallsyms;
pub mod perf_event;
pub mod perf_group;
pub mod proc_maps;
pub mod process;
pub mod profiler;
pub mod recorder;
pub mod sys;
