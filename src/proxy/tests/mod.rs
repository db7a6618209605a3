mod comprehensive;
mod support;
