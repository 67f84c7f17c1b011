//! macchiato is a miniature JVM that can load a single compiled class file
//! and interpret the bytecode of its `main` method.
//!
//! The pipeline has three stages, one module each :
//!
//! 1. `jvm` parses the class file binary into its raw sections.
//! 2. `program` resolves the parsed class into an executable image,
//!    methods with decoded descriptors and a constant pool.
//! 3. `runtime` evaluates a method's bytecode against an operand stack,
//!    a local variable array and a heap of integer arrays.
pub mod bytecode;
pub mod heap;
pub mod jvm;
pub mod program;
pub mod runtime;
