//! Embedder-to-compiled-code bridge: argument block construction, the
//! call through the entry thunk, and boxing of the raw result.

use object::{
    DoubleObject, FieldCode, FloatObject, IntObject, LongObject, Method,
    Object, RawArray, SpecIterator, WORD,
};

use crate::runtime::machine;
use crate::Thread;

/// One argument of an embedder invocation.
#[derive(Debug, Clone, Copy)]
pub enum InvokeArg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(*mut Object),
}

/// The memory image of a frame's header and argument region, low
/// address first: thread, method (filled in at the call), previous
/// frame, then the argument words with the receiver highest. A parallel
/// mask marks the words the collector must treat as references.
///
/// Lists link themselves on the thread so in-flight arguments stay
/// reachable, and unlink on drop.
pub struct ArgumentList {
    t: *mut Thread,
    pub(crate) next: *mut ArgumentList,
    linked: bool,
    pub words: Vec<usize>,
    pub object_mask: Vec<bool>,
}

impl ArgumentList {
    /// # Safety
    ///
    /// `t` must be live; the list must stay where the returned box puts
    /// it while linked.
    unsafe fn with_pushes(
        t: *mut Thread,
        pushes: Vec<(usize, bool)>,
    ) -> Box<ArgumentList> {
        let mut words = Vec::with_capacity(pushes.len() + 3);
        let mut object_mask = Vec::with_capacity(pushes.len() + 3);

        words.push(t as usize);
        object_mask.push(false);
        words.push(0); // method, installed by invoke()
        object_mask.push(false);
        words.push((*t).frame as usize);
        object_mask.push(false);

        // push order is receiver first; the frame image stores the last
        // push at the lowest address
        for &(word, is_object) in pushes.iter().rev() {
            words.push(word);
            object_mask.push(is_object);
        }

        let mut list = Box::new(ArgumentList {
            t,
            next: (*t).arguments,
            linked: true,
            words,
            object_mask,
        });
        (*t).arguments = list.as_mut() as *mut ArgumentList;
        list
    }

    /// A block carrying no receiver and no arguments.
    ///
    /// # Safety
    ///
    /// `t` must be live.
    pub unsafe fn new_empty(t: *mut Thread) -> Box<ArgumentList> {
        Self::with_pushes(t, Vec::new())
    }

    /// Build from typed embedder arguments.
    ///
    /// # Safety
    ///
    /// `t` must be live; `args` must match `spec`.
    pub unsafe fn from_args(
        t: *mut Thread,
        this: *mut Object,
        spec: &str,
        args: &[InvokeArg],
    ) -> Box<ArgumentList> {
        let mut pushes = Vec::new();
        if !this.is_null() {
            pushes.push((this as usize, true));
        }
        let mut remaining = args.iter();
        for head in SpecIterator::new(spec) {
            let arg = remaining
                .next()
                .unwrap_or_else(|| panic!("too few arguments for {spec}"));
            push_one(&mut pushes, head, *arg, spec);
        }
        assert!(
            remaining.next().is_none(),
            "too many arguments for {spec}"
        );
        Self::with_pushes(t, pushes)
    }

    /// Build from an array of boxed arguments.
    ///
    /// # Safety
    ///
    /// `t` must be live; `array` must hold one boxed value or reference
    /// per parameter, matching `spec`.
    pub unsafe fn from_array(
        t: *mut Thread,
        this: *mut Object,
        spec: &str,
        array: *mut RawArray,
    ) -> Box<ArgumentList> {
        let elements = RawArray::words(array);
        let mut pushes = Vec::new();
        if !this.is_null() {
            pushes.push((this as usize, true));
        }
        let mut index = 0usize;
        for head in SpecIterator::new(spec) {
            let element = elements[index] as *mut Object;
            index += 1;
            let arg = match head {
                b'L' | b'[' => InvokeArg::Object(element),
                b'J' => InvokeArg::Long(
                    (*(element as *mut LongObject)).value,
                ),
                b'D' => InvokeArg::Double(
                    (*(element as *mut DoubleObject)).value,
                ),
                b'F' => InvokeArg::Float(
                    (*(element as *mut FloatObject)).value,
                ),
                _ => InvokeArg::Int((*(element as *mut IntObject)).value),
            };
            push_one(&mut pushes, head, arg, spec);
        }
        Self::with_pushes(t, pushes)
    }

    fn set_method(&mut self, method: *mut Method) {
        self.words[1] = method as usize;
    }

    pub fn size_bytes(&self) -> usize {
        self.words.len() * WORD
    }
}

impl Drop for ArgumentList {
    fn drop(&mut self) {
        if self.linked {
            // SAFETY: lists unlink in LIFO order with the thread alive
            unsafe {
                debug_assert_eq!(
                    (*self.t).arguments,
                    self as *mut ArgumentList
                );
                (*self.t).arguments = self.next;
            }
        }
    }
}

fn push_one(
    pushes: &mut Vec<(usize, bool)>,
    head: u8,
    arg: InvokeArg,
    spec: &str,
) {
    match (head, arg) {
        (b'L' | b'[', InvokeArg::Object(o)) => pushes.push((o as usize, true)),
        (b'J', InvokeArg::Long(v)) => {
            if WORD == 8 {
                pushes.push((v as usize, false));
            } else {
                pushes.push(((v as u64 >> 32) as usize, false));
                pushes.push((v as u32 as usize, false));
            }
        }
        (b'D', InvokeArg::Double(v)) => {
            let bits = v.to_bits();
            if WORD == 8 {
                pushes.push((bits as usize, false));
            } else {
                pushes.push(((bits >> 32) as usize, false));
                pushes.push((bits as u32 as usize, false));
            }
        }
        (b'F', InvokeArg::Float(v)) => {
            pushes.push((v.to_bits() as usize, false));
        }
        (b'I' | b'S' | b'B' | b'C' | b'Z', InvokeArg::Int(v)) => {
            pushes.push((v as isize as usize, false));
        }
        (head, arg) => {
            panic!("argument {arg:?} does not match {:?} in {spec}", head as char)
        }
    }
}

/// Enter compiled code with an argument block, restore the frame and
/// reference chain afterwards, and box the result. Returns `None` when
/// the call left an exception pending.
///
/// # Safety
///
/// `t` and `method` must be live; `list` must have been built for
/// `method`'s spec.
pub unsafe fn invoke(
    t: *mut Thread,
    method: *mut Method,
    list: &mut ArgumentList,
) -> Option<*mut Object> {
    list.set_method(method);

    let m = machine(t);
    let vm_invoke: extern "C" fn(*const u8, *const usize, usize, u32) -> u64 =
        core::mem::transmute(m.invoke_thunk_entry());

    let saved_frame = (*t).frame;
    let saved_reference = (*t).reference;
    let return_code = (*method).return_code;

    let result = vm_invoke(
        (*method).code_entry,
        list.words.as_ptr(),
        list.size_bytes(),
        return_code as u32,
    );

    // release every local reference created during the call
    while (*t).reference != saved_reference {
        let reference = (*t).reference;
        (*t).reference = (*reference).next;
        drop(Box::from_raw(reference));
    }
    (*t).frame = saved_frame;

    if !(*t).exception.is_null() {
        return None;
    }

    Some(box_result(t, return_code, result))
}

unsafe fn box_result(
    t: *mut Thread,
    code: FieldCode,
    result: u64,
) -> *mut Object {
    let m = machine(t);
    match code {
        FieldCode::Byte
        | FieldCode::Boolean
        | FieldCode::Char
        | FieldCode::Short
        | FieldCode::Int => {
            let obj = m.allocate(core::mem::size_of::<IntObject>())
                as *mut IntObject;
            if obj.is_null() {
                return m.specials.oom_instance;
            }
            (*obj).class = m.specials.int_box;
            (*obj).value = result as i32;
            obj as *mut Object
        }
        FieldCode::Long => {
            let obj = m.allocate(core::mem::size_of::<LongObject>())
                as *mut LongObject;
            if obj.is_null() {
                return m.specials.oom_instance;
            }
            (*obj).class = m.specials.long_box;
            (*obj).value = result as i64;
            obj as *mut Object
        }
        FieldCode::Float => {
            let obj = m.allocate(core::mem::size_of::<FloatObject>())
                as *mut FloatObject;
            if obj.is_null() {
                return m.specials.oom_instance;
            }
            (*obj).class = m.specials.float_box;
            (*obj).value = f32::from_bits(result as u32);
            obj as *mut Object
        }
        FieldCode::Double => {
            let obj = m.allocate(core::mem::size_of::<DoubleObject>())
                as *mut DoubleObject;
            if obj.is_null() {
                return m.specials.oom_instance;
            }
            (*obj).class = m.specials.double_box;
            (*obj).value = f64::from_bits(result);
            obj as *mut Object
        }
        FieldCode::Object => result as usize as *mut Object,
        FieldCode::Void => core::ptr::null_mut(),
    }
}
