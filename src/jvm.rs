//! Lightweight parser and decoder for JVM class files.
//!
//! Only the sections the interpreter consumes are decoded : the constant
//! pool, the method table and each method's `Code` attribute. Every other
//! attribute is skipped by its declared length. Constant kinds outside the
//! supported integer/reference subset (longs, doubles, floats, the
//! dynamic-linking tags) are rejected up front.
use byteorder::{BigEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

/// Values of magic bytes of a JVM class file.
const JVM_CLASS_FILE_MAGIC: u32 = 0xCAFE_BABE;

/// `ClassFileError` represents the ways reading a class file can fail,
/// from I/O problems to structurally well-formed files that use features
/// outside the supported subset.
#[derive(Debug)]
pub enum ClassFileError {
    Io(io::Error),
    BadMagic(u32),
    UnsupportedConstant(u8),
    MalformedUtf8,
    MalformedAttributeName(u16),
    MissingCodeAttribute(String),
    MalformedDescriptor(String),
}

impl fmt::Display for ClassFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "i/o error reading class file: {err}"),
            Self::BadMagic(magic) => {
                write!(f, "expected magic 0xCAFEBABE, found {magic:#010x}")
            }
            Self::UnsupportedConstant(tag) => {
                write!(f, "unsupported constant pool tag {tag}")
            }
            Self::MalformedUtf8 => {
                write!(f, "constant pool holds invalid UTF-8")
            }
            Self::MalformedAttributeName(index) => {
                write!(
                    f,
                    "attribute name at constant pool index {index} is not UTF-8"
                )
            }
            Self::MissingCodeAttribute(name) => {
                write!(f, "method {name} has no Code attribute")
            }
            Self::MalformedDescriptor(descriptor) => {
                write!(f, "cannot decode method descriptor {descriptor}")
            }
        }
    }
}

impl From<io::Error> for ClassFileError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// `CPInfo` represents constant pool entries.
#[derive(Debug, Clone)]
pub enum CPInfo {
    ConstantClass {
        name_index: u16,
    },
    ConstantFieldRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantInterfaceMethodRef {
        class_index: u16,
        name_and_type_index: u16,
    },
    ConstantString {
        string_index: u16,
    },
    ConstantInteger {
        bytes: u32,
    },
    ConstantNameAndType {
        name_index: u16,
        descriptor_index: u16,
    },
    ConstantUtf8 {
        bytes: String,
    },
    // Proxy value used to populate the gaps in the constant pool.
    Unspecified,
}

/// `ConstantKind` encodes the kind of a constant in the constants pool.
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
enum ConstantKind {
    Utf8 = 1,
    Integer = 3,
    Class = 7,
    String = 8,
    FieldRef = 9,
    MethodRef = 10,
    InterfaceMethodRef = 11,
    NameAndType = 12,
    Unspecified,
}

impl From<u8> for ConstantKind {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Utf8,
            3 => Self::Integer,
            7 => Self::Class,
            8 => Self::String,
            9 => Self::FieldRef,
            10 => Self::MethodRef,
            11 => Self::InterfaceMethodRef,
            12 => Self::NameAndType,
            _ => Self::Unspecified,
        }
    }
}

#[derive(Debug, Clone)]
pub enum AttributeInfo {
    CodeAttribute {
        max_stack: u16,
        max_locals: u16,
        code: Vec<u8>,
    },
}

const ATTRIBUTE_NAME_CODE: &str = "Code";

#[derive(Debug, Clone)]
pub struct FieldInfo {
    access_flag: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: HashMap<String, AttributeInfo>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    access_flag: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: HashMap<String, AttributeInfo>,
}

impl MethodInfo {
    pub const fn access_flag(&self) -> u16 {
        self.access_flag
    }

    pub const fn name_index(&self) -> u16 {
        self.name_index
    }

    pub const fn descriptor_index(&self) -> u16 {
        self.descriptor_index
    }

    pub const fn attributes(&self) -> &HashMap<String, AttributeInfo> {
        &self.attributes
    }
}

/// `JVMClassFile` represents a Java class file.
#[derive(Debug, Clone)]
pub struct JVMClassFile {
    magic: u32,
    minor_version: u16,
    major_version: u16,
    constant_pool: Vec<CPInfo>,
    access_flags: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
}

impl JVMClassFile {
    pub const fn magic(&self) -> u32 {
        self.magic
    }

    pub const fn minor_version(&self) -> u16 {
        self.minor_version
    }

    pub const fn major_version(&self) -> u16 {
        self.major_version
    }

    pub fn constant_pool(&self) -> &[CPInfo] {
        &self.constant_pool
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }
}

/// `JVMParser` namespaces functions that handle parsing of Java class files.
#[derive(Debug)]
pub struct JVMParser;

impl JVMParser {
    /// Parse a preloaded Java class file.
    pub fn parse(
        class_file_bytes: &[u8],
    ) -> Result<JVMClassFile, ClassFileError> {
        // Create a new cursor on the class file bytes.
        let mut buffer = Cursor::new(class_file_bytes);
        // Read the magic header and the class file version numbers.
        let magic = buffer.read_u32::<BigEndian>()?;
        if magic != JVM_CLASS_FILE_MAGIC {
            return Err(ClassFileError::BadMagic(magic));
        }
        let minor_version = buffer.read_u16::<BigEndian>()?;
        let major_version = buffer.read_u16::<BigEndian>()?;
        // Allocate a new pool and populate it with the constants. The first
        // usable entry sits at index 1 according to the JVM spec, index 0
        // stays `Unspecified`.
        let constant_pool_count = buffer.read_u16::<BigEndian>()?;
        let mut constant_pool =
            vec![CPInfo::Unspecified; constant_pool_count as usize];
        for ii in 1..constant_pool_count as usize {
            let tag = buffer.read_u8()?;
            let value = match ConstantKind::from(tag) {
                ConstantKind::Class => CPInfo::ConstantClass {
                    name_index: buffer.read_u16::<BigEndian>()?,
                },
                ConstantKind::FieldRef => CPInfo::ConstantFieldRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                },
                ConstantKind::MethodRef => CPInfo::ConstantMethodRef {
                    class_index: buffer.read_u16::<BigEndian>()?,
                    name_and_type_index: buffer.read_u16::<BigEndian>()?,
                },
                ConstantKind::InterfaceMethodRef => {
                    CPInfo::ConstantInterfaceMethodRef {
                        class_index: buffer.read_u16::<BigEndian>()?,
                        name_and_type_index: buffer.read_u16::<BigEndian>()?,
                    }
                }
                ConstantKind::String => CPInfo::ConstantString {
                    string_index: buffer.read_u16::<BigEndian>()?,
                },
                ConstantKind::Integer => CPInfo::ConstantInteger {
                    bytes: buffer.read_u32::<BigEndian>()?,
                },
                ConstantKind::NameAndType => CPInfo::ConstantNameAndType {
                    name_index: buffer.read_u16::<BigEndian>()?,
                    descriptor_index: buffer.read_u16::<BigEndian>()?,
                },
                ConstantKind::Utf8 => {
                    let length = buffer.read_u16::<BigEndian>()?;
                    let mut buf = vec![0u8; length as usize];
                    buffer.read_exact(&mut buf)?;
                    CPInfo::ConstantUtf8 {
                        bytes: String::from_utf8(buf)
                            .map_err(|_| ClassFileError::MalformedUtf8)?,
                    }
                }
                ConstantKind::Unspecified => {
                    return Err(ClassFileError::UnsupportedConstant(tag));
                }
            };
            constant_pool[ii] = value;
        }

        let access_flags = buffer.read_u16::<BigEndian>()?;
        let this_class = buffer.read_u16::<BigEndian>()?;
        let super_class = buffer.read_u16::<BigEndian>()?;

        let interfaces_count = buffer.read_u16::<BigEndian>()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(buffer.read_u16::<BigEndian>()?);
        }

        let fields = parse_fields(&mut buffer, &constant_pool)?;
        let methods = parse_methods(&mut buffer, &constant_pool)?;

        Ok(JVMClassFile {
            magic,
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
        })
    }
}

/// Parse fields.
fn parse_fields(
    reader: &mut (impl Read + Seek),
    constant_pool: &[CPInfo],
) -> Result<Vec<FieldInfo>, ClassFileError> {
    let fields_count = reader.read_u16::<BigEndian>()?;
    let mut fields: Vec<FieldInfo> = Vec::with_capacity(fields_count as usize);

    for _ in 0..fields_count {
        let access_flag = reader.read_u16::<BigEndian>()?;
        let name_index = reader.read_u16::<BigEndian>()?;
        let descriptor_index = reader.read_u16::<BigEndian>()?;
        let attributes = parse_attribute_info(reader, constant_pool)?;
        fields.push(FieldInfo {
            access_flag,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    Ok(fields)
}

/// Parse methods.
fn parse_methods(
    reader: &mut (impl Read + Seek),
    constant_pool: &[CPInfo],
) -> Result<Vec<MethodInfo>, ClassFileError> {
    let methods_count = reader.read_u16::<BigEndian>()?;
    let mut methods: Vec<MethodInfo> =
        Vec::with_capacity(methods_count as usize);

    for _ in 0..methods_count {
        let access_flag = reader.read_u16::<BigEndian>()?;
        let name_index = reader.read_u16::<BigEndian>()?;
        let descriptor_index = reader.read_u16::<BigEndian>()?;
        let attributes = parse_attribute_info(reader, constant_pool)?;
        methods.push(MethodInfo {
            access_flag,
            name_index,
            descriptor_index,
            attributes,
        });
    }

    Ok(methods)
}

/// Parse an attribute table, decoding `Code` attributes and skipping all
/// others by their declared length.
fn parse_attribute_info(
    reader: &mut (impl Read + Seek),
    constant_pool: &[CPInfo],
) -> Result<HashMap<String, AttributeInfo>, ClassFileError> {
    let attribute_count = reader.read_u16::<BigEndian>()?;
    let mut attributes: HashMap<String, AttributeInfo> = HashMap::new();
    for _ in 0..attribute_count {
        let attribute_name_index = reader.read_u16::<BigEndian>()?;
        let attribute_name =
            match constant_pool.get(attribute_name_index as usize) {
                Some(CPInfo::ConstantUtf8 { bytes }) => bytes.clone(),
                _ => {
                    return Err(ClassFileError::MalformedAttributeName(
                        attribute_name_index,
                    ));
                }
            };
        let attribute_length = reader.read_u32::<BigEndian>()?;
        if attribute_name == ATTRIBUTE_NAME_CODE {
            let max_stack = reader.read_u16::<BigEndian>()?;
            let max_locals = reader.read_u16::<BigEndian>()?;
            let code_length = reader.read_u32::<BigEndian>()?;
            let mut code = vec![0u8; code_length as usize];
            reader.read_exact(&mut code)?;
            // The exception table and nested attributes (line numbers,
            // stack map table) play no part in execution, skip them.
            let exception_table_length = reader.read_u16::<BigEndian>()?;
            reader.seek(io::SeekFrom::Current(
                i64::from(exception_table_length) * 8,
            ))?;
            skip_attribute_info(reader)?;
            attributes.insert(
                attribute_name,
                AttributeInfo::CodeAttribute {
                    max_stack,
                    max_locals,
                    code,
                },
            );
        } else {
            reader.seek(io::SeekFrom::Current(i64::from(attribute_length)))?;
        }
    }
    Ok(attributes)
}

/// Skip over an attribute table without decoding it.
fn skip_attribute_info(
    reader: &mut (impl Read + Seek),
) -> Result<(), ClassFileError> {
    let attribute_count = reader.read_u16::<BigEndian>()?;
    for _ in 0..attribute_count {
        let _attribute_name_index = reader.read_u16::<BigEndian>()?;
        let attribute_length = reader.read_u32::<BigEndian>()?;
        reader.seek(io::SeekFrom::Current(i64::from(attribute_length)))?;
    }
    Ok(())
}

/// Helper function to read a class file into a buffer.
pub fn read_class_file(fp: &Path) -> io::Result<Vec<u8>> {
    fs::read(fp)
}
