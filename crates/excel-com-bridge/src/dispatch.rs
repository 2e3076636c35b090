//! Late-bound COM automation through IDispatch.
//!
//! Every failure carries the HRESULT of the call that failed so the client can
//! tell a dead server from a busy one or a locked file.

#![cfg(windows)]

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;

use windows::{
    core::{BSTR, GUID, HSTRING, PCWSTR},
    Win32::{
        Foundation::{DISP_E_EXCEPTION, VARIANT_BOOL},
        Globalization::GetSystemDefaultLCID,
        System::{
            Com::{
                CLSIDFromProgID, CoCreateInstance, IDispatch, CLSCTX_LOCAL_SERVER, DISPATCH_FLAGS,
                DISPATCH_METHOD, DISPATCH_PROPERTYGET, DISPATCH_PROPERTYPUT, DISPPARAMS,
                EXCEPINFO,
            },
            Ole::DISPID_PROPERTYPUT,
            Variant::{
                VARIANT, VT_BOOL, VT_BSTR, VT_DISPATCH, VT_EMPTY, VT_ERROR, VT_I2, VT_I4, VT_NULL,
                VT_R4, VT_R8,
            },
        },
    },
};

/// A failed COM call.
#[derive(Debug, Clone)]
pub struct ComError {
    pub hresult: Option<u32>,
    pub message: String,
}

impl ComError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            hresult: None,
            message: message.into(),
        }
    }

    fn from_windows(err: &windows::core::Error, context: &str) -> Self {
        Self {
            hresult: Some(err.code().0 as u32),
            message: format!("{context}: {}", err.message()),
        }
    }
}

impl fmt::Display for ComError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hresult {
            Some(code) => write!(f, "{} (HRESULT 0x{code:08X})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// An argument passed into a COM call.
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Empty,
    Bool(bool),
    F64(f64),
    I32(i32),
    Str(&'a str),
}

impl Arg<'_> {
    pub fn to_variant(self) -> VARIANT {
        // The VARIANT unions are ManuallyDrop, so fields are written with
        // ptr::write rather than assignment.
        let mut v = VARIANT::default();
        unsafe {
            let inner = &mut *v.Anonymous.Anonymous;
            match self {
                Arg::Empty => {}
                Arg::Bool(b) => {
                    ptr::write(&mut inner.vt, VT_BOOL);
                    ptr::write(
                        &mut inner.Anonymous.boolVal,
                        VARIANT_BOOL(if b { -1 } else { 0 }),
                    );
                }
                Arg::F64(n) => {
                    ptr::write(&mut inner.vt, VT_R8);
                    ptr::write(&mut inner.Anonymous.dblVal, n);
                }
                Arg::I32(n) => {
                    ptr::write(&mut inner.vt, VT_I4);
                    ptr::write(&mut inner.Anonymous.lVal, n);
                }
                Arg::Str(s) => {
                    ptr::write(&mut inner.vt, VT_BSTR);
                    ptr::write(&mut inner.Anonymous.bstrVal, ManuallyDrop::new(BSTR::from(s)));
                }
            }
        }
        v
    }
}

/// A value read back from a COM call.
pub enum Returned {
    Empty,
    Bool(bool),
    Number(f64),
    Str(String),
    Object(DispatchObject),
    /// `VT_ERROR` with its SCODE (cell errors such as `#DIV/0!`).
    Error(i32),
    Other(u16),
}

impl Returned {
    pub fn from_variant(v: &VARIANT) -> Self {
        unsafe {
            let vt = v.Anonymous.Anonymous.vt;
            let anon = &v.Anonymous.Anonymous.Anonymous;
            if vt == VT_EMPTY || vt == VT_NULL {
                Returned::Empty
            } else if vt == VT_BOOL {
                Returned::Bool(anon.boolVal.0 != 0)
            } else if vt == VT_R8 {
                Returned::Number(anon.dblVal)
            } else if vt == VT_R4 {
                Returned::Number(anon.fltVal as f64)
            } else if vt == VT_I4 {
                Returned::Number(anon.lVal as f64)
            } else if vt == VT_I2 {
                Returned::Number(anon.iVal as f64)
            } else if vt == VT_BSTR {
                Returned::Str(anon.bstrVal.to_string())
            } else if vt == VT_ERROR {
                Returned::Error(anon.scode)
            } else if vt == VT_DISPATCH {
                match anon.pdispVal.as_ref() {
                    Some(disp) => Returned::Object(DispatchObject {
                        inner: disp.clone(),
                    }),
                    None => Returned::Empty,
                }
            } else {
                Returned::Other(vt.0)
            }
        }
    }

    pub fn into_object(self, context: &str) -> Result<DispatchObject, ComError> {
        match self {
            Returned::Object(obj) => Ok(obj),
            Returned::Empty => Err(ComError::new(format!("'{context}' returned nothing"))),
            _ => Err(ComError::new(format!("'{context}' did not return an object"))),
        }
    }
}

/// An IDispatch pointer. Released when dropped.
#[derive(Clone)]
pub struct DispatchObject {
    inner: IDispatch,
}

impl DispatchObject {
    /// Create a COM object from a ProgID string (e.g., "Excel.Application").
    pub fn create(progid: &str) -> Result<Self, ComError> {
        unsafe {
            let clsid = CLSIDFromProgID(&HSTRING::from(progid))
                .map_err(|e| ComError::from_windows(&e, "CLSIDFromProgID"))?;
            let inner: IDispatch = CoCreateInstance(&clsid, None, CLSCTX_LOCAL_SERVER)
                .map_err(|e| ComError::from_windows(&e, &format!("CoCreateInstance({progid})")))?;
            Ok(Self { inner })
        }
    }

    pub fn get(&self, name: &str) -> Result<Returned, ComError> {
        self.call(name, DISPATCH_PROPERTYGET, &[], false)
    }

    pub fn get_object(&self, name: &str) -> Result<DispatchObject, ComError> {
        self.get(name)?.into_object(name)
    }

    /// Indexed property such as `Worksheets.Item(1)` or `Range("A1")`.
    pub fn get_item(&self, name: &str, index: Arg<'_>) -> Result<DispatchObject, ComError> {
        self.call(name, DISPATCH_PROPERTYGET, &[index], false)?
            .into_object(name)
    }

    pub fn put(&self, name: &str, value: Arg<'_>) -> Result<(), ComError> {
        self.call(name, DISPATCH_PROPERTYPUT, &[value], true)
            .map(|_| ())
    }

    /// Call a method. `args` are in natural order.
    pub fn invoke(&self, name: &str, args: &[Arg<'_>]) -> Result<Returned, ComError> {
        self.call(name, DISPATCH_METHOD, args, false)
    }

    fn dispid(&self, name: &str) -> Result<i32, ComError> {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        let names = [PCWSTR(wide.as_ptr())];
        let mut dispid = 0i32;
        unsafe {
            self.inner
                .GetIDsOfNames(
                    &GUID::zeroed(),
                    names.as_ptr(),
                    1,
                    GetSystemDefaultLCID(),
                    &mut dispid,
                )
                .map_err(|e| ComError::from_windows(&e, &format!("GetIDsOfNames({name})")))?;
        }
        Ok(dispid)
    }

    fn call(
        &self,
        name: &str,
        flags: DISPATCH_FLAGS,
        args: &[Arg<'_>],
        property_put: bool,
    ) -> Result<Returned, ComError> {
        let dispid = self.dispid(name)?;

        // DISPPARAMS wants arguments last-to-first.
        let mut variants: Vec<VARIANT> = args.iter().rev().map(|a| a.to_variant()).collect();
        let mut named = [DISPID_PROPERTYPUT];
        let params = DISPPARAMS {
            rgvarg: if variants.is_empty() {
                ptr::null_mut()
            } else {
                variants.as_mut_ptr()
            },
            rgdispidNamedArgs: if property_put {
                named.as_mut_ptr()
            } else {
                ptr::null_mut()
            },
            cArgs: variants.len() as u32,
            cNamedArgs: u32::from(property_put),
        };

        let mut result = VARIANT::default();
        let mut except = EXCEPINFO::default();
        let invoked = unsafe {
            self.inner.Invoke(
                dispid,
                &GUID::zeroed(),
                GetSystemDefaultLCID(),
                flags,
                &params,
                (!property_put).then_some(&mut result as *mut VARIANT),
                Some(&mut except),
                None,
            )
        };

        match invoked {
            Ok(()) => Ok(Returned::from_variant(&result)),
            Err(e) => Err(invoke_error(&e, &except, name)),
        }
    }
}

/// For `DISP_E_EXCEPTION` the interesting code is the one Excel put into the
/// EXCEPINFO, not the dispatch wrapper's.
fn invoke_error(err: &windows::core::Error, except: &EXCEPINFO, member: &str) -> ComError {
    if err.code() != DISP_E_EXCEPTION {
        return ComError::from_windows(err, &format!("Invoke({member})"));
    }

    let description = if except.bstrDescription.is_empty() {
        "(no description)".to_string()
    } else {
        except.bstrDescription.to_string()
    };
    let hresult = if except.scode != 0 {
        except.scode as u32
    } else {
        err.code().0 as u32
    };
    ComError {
        hresult: Some(hresult),
        message: format!("'{member}' raised: {description}"),
    }
}
