pub mod blob;
pub mod edt;
pub mod grid;
pub mod interp;
pub mod jsonc;
pub mod labels;
pub mod resample;
