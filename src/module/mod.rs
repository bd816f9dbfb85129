pub mod double_conv;
