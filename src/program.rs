//! Executable representation of the class under execution.
//!
//! `Program` flattens a parsed class file into what the interpreter
//! actually consumes : a constant pool and a list of methods with resolved
//! names, decoded descriptors and their code bytes.
use crate::jvm::{AttributeInfo, CPInfo, ClassFileError, JVMClassFile};

use regex::Regex;

/// The name of the method invoked to run a class file.
pub const MAIN_METHOD: &str = "main";
/// The descriptor of the entry method : `main` takes a `String[]` and
/// returns void.
pub const MAIN_DESCRIPTOR: &str = "([Ljava/lang/String;)V";

/// Primitive types a supported descriptor can mention.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BaseTypeKind {
    Int,
    Void,
    Object,
    List,
}

/// Decoded descriptor type. Lists carry their element type.
#[derive(Debug, Clone)]
pub struct Type {
    t: BaseTypeKind,
    sub_t: Option<Box<Type>>,
}

impl Type {
    pub const fn kind(&self) -> BaseTypeKind {
        self.t
    }
}

/// A single method of the loaded class, ready to execute.
#[derive(Debug, Clone)]
pub struct Method {
    name: String,
    descriptor: String,
    arg_types: Vec<Type>,
    return_type: Type,
    max_stack: u16,
    max_locals: u16,
    code: Vec<u8>,
}

impl Method {
    /// Builds a method from its resolved strings and code attribute,
    /// decoding the descriptor into parameter and return types.
    pub fn new(
        name: &str,
        descriptor: &str,
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    ) -> Result<Self, ClassFileError> {
        let (arg_types, return_type) = parse_method_types(descriptor)?;
        Ok(Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            arg_types,
            return_type,
            max_stack,
            max_locals,
            code,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub const fn max_stack(&self) -> u16 {
        self.max_stack
    }

    pub const fn max_locals(&self) -> u16 {
        self.max_locals
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Number of parameter slots. Every supported parameter type occupies
    /// exactly one local slot.
    pub fn param_count(&self) -> usize {
        self.arg_types.len()
    }

    pub const fn returns_value(&self) -> bool {
        !matches!(self.return_type.t, BaseTypeKind::Void)
    }
}

/// Representation of the program we want to run : the constant pool plus
/// the class methods, addressed by their position in the method table.
#[derive(Debug, Clone)]
pub struct Program {
    constant_pool: Vec<CPInfo>,
    methods: Vec<Method>,
}

impl Program {
    /// Build a new program from a parsed class file.
    pub fn new(class_file: &JVMClassFile) -> Result<Self, ClassFileError> {
        let constant_pool = class_file.constant_pool().to_vec();
        let mut methods = Vec::with_capacity(class_file.methods().len());
        for method_info in class_file.methods() {
            let name = utf8(&constant_pool, method_info.name_index() as usize)
                .unwrap_or_default()
                .to_string();
            let descriptor = utf8(
                &constant_pool,
                method_info.descriptor_index() as usize,
            )
            .unwrap_or_default()
            .to_string();
            let Some(AttributeInfo::CodeAttribute {
                max_stack,
                max_locals,
                code,
            }) = method_info.attributes().get("Code")
            else {
                return Err(ClassFileError::MissingCodeAttribute(name));
            };
            methods.push(Method::new(
                &name,
                &descriptor,
                *max_stack,
                *max_locals,
                code.clone(),
            )?);
        }
        Ok(Self::from_parts(constant_pool, methods))
    }

    /// Assemble a program from an already resolved constant pool and
    /// method list.
    pub fn from_parts(
        constant_pool: Vec<CPInfo>,
        methods: Vec<Method>,
    ) -> Self {
        Self {
            constant_pool,
            methods,
        }
    }

    /// Returns the method at `index` in the method table.
    pub fn method(&self, index: usize) -> &Method {
        &self.methods[index]
    }

    /// Locate a method by exact name and descriptor match.
    pub fn find_method(&self, name: &str, descriptor: &str) -> Option<usize> {
        self.methods
            .iter()
            .position(|m| m.name == name && m.descriptor == descriptor)
    }

    /// Resolve a constant pool `MethodRef` at 1-based `cp_index` to the
    /// method it names within this class.
    pub fn find_method_from_index(&self, cp_index: usize) -> Option<usize> {
        let name_and_type_index = match self.constant_pool.get(cp_index)? {
            CPInfo::ConstantMethodRef {
                name_and_type_index,
                ..
            } => *name_and_type_index as usize,
            _ => return None,
        };
        let CPInfo::ConstantNameAndType {
            name_index,
            descriptor_index,
        } = self.constant_pool.get(name_and_type_index)?
        else {
            return None;
        };
        let name = utf8(&self.constant_pool, *name_index as usize)?;
        let descriptor = utf8(&self.constant_pool, *descriptor_index as usize)?;
        self.find_method(name, descriptor)
    }

    /// Returns the integer constant stored at 1-based `cp_index`, if that
    /// entry is an integer.
    pub fn integer_constant(&self, cp_index: usize) -> Option<i32> {
        match self.constant_pool.get(cp_index)? {
            CPInfo::ConstantInteger { bytes } => Some(*bytes as i32),
            _ => None,
        }
    }

    /// Returns the program entry point, the index of `main`.
    pub fn entry_point(&self) -> Option<usize> {
        self.find_method(MAIN_METHOD, MAIN_DESCRIPTOR)
    }
}

/// Resolve a UTF-8 constant pool entry to its string.
fn utf8(constant_pool: &[CPInfo], index: usize) -> Option<&str> {
    match constant_pool.get(index)? {
        CPInfo::ConstantUtf8 { bytes } => Some(bytes),
        _ => None,
    }
}

/// Split a method descriptor into its argument types and return type.
fn parse_method_types(
    descriptor: &str,
) -> Result<(Vec<Type>, Type), ClassFileError> {
    let re = Regex::new(r"\(([^)]*)\)(.+)").expect("descriptor regex");
    let caps = re.captures(descriptor).ok_or_else(|| {
        ClassFileError::MalformedDescriptor(descriptor.to_string())
    })?;
    let arg_string = caps.get(1).map_or("", |m| m.as_str());
    let return_type_string = caps.get(2).map_or("", |m| m.as_str());

    let mut types: Vec<Type> = Vec::new();
    let mut rest = arg_string;
    while !rest.is_empty() {
        let (t, length) = decode_type(rest, descriptor)?;
        types.push(t);
        rest = &rest[length..];
    }
    let (return_type, _) = decode_type(return_type_string, descriptor)?;
    Ok((types, return_type))
}

/// Decode the leading type of a descriptor fragment, returning the type
/// and how many characters it spans.
fn decode_type(
    fragment: &str,
    descriptor: &str,
) -> Result<(Type, usize), ClassFileError> {
    let malformed =
        || ClassFileError::MalformedDescriptor(descriptor.to_string());
    match *fragment.as_bytes().first().ok_or_else(malformed)? {
        b'I' => Ok((
            Type {
                t: BaseTypeKind::Int,
                sub_t: None,
            },
            1,
        )),
        b'V' => Ok((
            Type {
                t: BaseTypeKind::Void,
                sub_t: None,
            },
            1,
        )),
        b'[' => {
            let (sub_t, length) = decode_type(&fragment[1..], descriptor)?;
            Ok((
                Type {
                    t: BaseTypeKind::List,
                    sub_t: Some(Box::new(sub_t)),
                },
                length + 1,
            ))
        }
        b'L' => {
            // Class types span up to and including the ';' terminator.
            let end = fragment.find(';').ok_or_else(malformed)?;
            Ok((
                Type {
                    t: BaseTypeKind::Object,
                    sub_t: None,
                },
                end + 1,
            ))
        }
        _ => Err(malformed()),
    }
}
