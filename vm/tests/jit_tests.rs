//! End-to-end coverage: compiled arithmetic, array templates, field
//! access, exception dispatch, lazy compilation with call-site
//! patching, native methods and the embedder-visible invariants.

use object::{
    Class, CodeRecord, DoubleObject, FloatObject, HandlerEntry, IntObject,
    Method, MethodCode, MethodFlags, Object, RawArray, WORD,
};
use vm::bootstrap::{self, ClassBuilder};
use vm::bridge::InvokeArg;
use vm::{op, processor, runtime, Machine, Thread};

fn setup() -> (Box<Machine>, *mut Thread) {
    let machine = bootstrap::machine();
    let t = machine
        .make_thread(core::ptr::null_mut(), core::ptr::null_mut());
    (machine, t)
}

unsafe fn int_value(obj: *mut Object) -> i32 {
    (*(obj as *mut IntObject)).value
}

unsafe fn find(class: *mut Class, name: &str, spec: &str) -> *mut Method {
    Class::find_method(class, name, spec).expect("method exists")
}

unsafe fn pending_class(t: *mut Thread) -> *mut Class {
    assert!(!(*t).exception.is_null(), "no exception pending");
    let class = (*(*t).exception).class;
    (*t).exception = core::ptr::null_mut();
    class
}

unsafe fn new_instance(m: &Machine, class: *mut Class) -> *mut Object {
    let obj = m.allocate((*class).instance_size) as *mut Object;
    assert!(!obj.is_null());
    (*obj).class = class;
    obj
}

#[test]
fn adds_two_ints_without_helper_calls() {
    let (machine, t) = setup();
    let class = ClassBuilder::new(&machine, "Calc")
        .extends(machine.specials.object)
        .method(
            "add",
            "(II)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ILOAD_0, op::ILOAD_1, op::IADD, op::IRETURN],
                2,
            )),
        )
        .build();

    unsafe {
        let add = find(class, "add", "(II)I");
        let result = processor::invoke_list(
            t,
            add,
            core::ptr::null_mut(),
            &[InvokeArg::Int(3), InvokeArg::Int(4)],
        )
        .expect("add result");
        assert_eq!(int_value(result), 7);

        // straight-line arithmetic needs no runtime assistance
        let code = (*add).compiled.as_ref().expect("compiled").code();
        assert!(!code.windows(2).any(|w| {
            w[0] == 0xFF && (0xD0..=0xD7).contains(&w[1])
        }));
        assert!(!code.contains(&0xE8));
    }
}

#[test]
fn negative_numbers_survive_the_word_stack() {
    let (machine, t) = setup();
    let class = ClassBuilder::new(&machine, "Neg")
        .extends(machine.specials.object)
        .method(
            "sub",
            "(II)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ILOAD_0, op::ILOAD_1, op::ISUB, op::IRETURN],
                2,
            )),
        )
        .build();

    unsafe {
        let sub = find(class, "sub", "(II)I");
        let result = processor::invoke_list(
            t,
            sub,
            core::ptr::null_mut(),
            &[InvokeArg::Int(-3), InvokeArg::Int(4)],
        )
        .expect("sub result");
        assert_eq!(int_value(result), -7);
    }
}

#[test]
fn loops_branches_and_iinc() {
    let (machine, t) = setup();
    // int sum(int n) { int acc = 0; for (int i = 1; i <= n; i++) acc += i; return acc; }
    let class = ClassBuilder::new(&machine, "Loop")
        .extends(machine.specials.object)
        .method(
            "sum",
            "(I)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![
                    op::ICONST_0,
                    op::ISTORE_1,
                    op::ICONST_1,
                    op::ISTORE_2,
                    op::ILOAD_2,
                    op::ILOAD_0,
                    op::IF_ICMPGT,
                    0x00,
                    0x0D,
                    op::ILOAD_1,
                    op::ILOAD_2,
                    op::IADD,
                    op::ISTORE_1,
                    op::IINC,
                    0x02,
                    0x01,
                    op::GOTO,
                    0xFF,
                    0xF4,
                    op::ILOAD_1,
                    op::IRETURN,
                ],
                3,
            )),
        )
        .build();

    unsafe {
        let sum = find(class, "sum", "(I)I");
        for (n, expected) in [(0, 0), (1, 1), (10, 55), (100, 5050)] {
            let result = processor::invoke_list(
                t,
                sum,
                core::ptr::null_mut(),
                &[InvokeArg::Int(n)],
            )
            .expect("sum result");
            assert_eq!(int_value(result), expected, "sum({n})");
        }
    }
}

#[test]
fn array_load_with_bounds_check() {
    let (machine, t) = setup();
    let class = ClassBuilder::new(&machine, "Arrays")
        .extends(machine.specials.object)
        .method(
            "get",
            "([II)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ALOAD_0, op::ILOAD_1, op::IALOAD, op::IRETURN],
                2,
            )),
        )
        .build();

    unsafe {
        let get = find(class, "get", "([II)I");
        let array = machine.allocate_array(machine.specials.int_array, 3);
        RawArray::words_mut(array).copy_from_slice(&[10, 20, 30]);
        let array_obj = array as *mut Object;

        let result = processor::invoke_list(
            t,
            get,
            core::ptr::null_mut(),
            &[InvokeArg::Object(array_obj), InvokeArg::Int(1)],
        )
        .expect("in-bounds load");
        assert_eq!(int_value(result), 20);

        for bad in [3, -1] {
            let result = processor::invoke_list(
                t,
                get,
                core::ptr::null_mut(),
                &[InvokeArg::Object(array_obj), InvokeArg::Int(bad)],
            );
            assert!(result.is_none(), "index {bad} must fault");
            assert_eq!(
                pending_class(t),
                machine.specials.array_index_out_of_bounds
            );
        }
    }
}

#[test]
fn array_store_length_and_wide_elements() {
    let (machine, t) = setup();
    // void swap(long[] a) { a[1] = a[0]; }
    // int len(int[] a)    { return a.length; }
    let class = ClassBuilder::new(&machine, "Wide")
        .extends(machine.specials.object)
        .method(
            "copy",
            "([J)V",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![
                    op::ALOAD_0,
                    op::ICONST_1,
                    op::ALOAD_0,
                    op::ICONST_0,
                    op::LALOAD,
                    op::LASTORE,
                    op::RETURN,
                ],
                1,
            )),
        )
        .method(
            "len",
            "([I)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ALOAD_0, op::ARRAYLENGTH, op::IRETURN],
                1,
            )),
        )
        .build();

    unsafe {
        let longs = machine.allocate_array(machine.specials.long_array, 2);
        RawArray::words_mut(longs)[0] = 0x1122_3344_5566_7788;
        let copy = find(class, "copy", "([J)V");
        processor::invoke_list(
            t,
            copy,
            core::ptr::null_mut(),
            &[InvokeArg::Object(longs as *mut Object)],
        )
        .expect("copy");
        assert_eq!(RawArray::words(longs)[1], 0x1122_3344_5566_7788);

        let ints = machine.allocate_array(machine.specials.int_array, 5);
        let len = find(class, "len", "([I)I");
        let result = processor::invoke_list(
            t,
            len,
            core::ptr::null_mut(),
            &[InvokeArg::Object(ints as *mut Object)],
        )
        .expect("len");
        assert_eq!(int_value(result), 5);
    }
}

#[test]
fn newarray_and_negative_size() {
    let (machine, t) = setup();
    let class = ClassBuilder::new(&machine, "Mk")
        .extends(machine.specials.object)
        .method(
            "mk",
            "(I)[I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ILOAD_0, op::NEWARRAY, op::T_INT, op::ARETURN],
                1,
            )),
        )
        .build();

    unsafe {
        let mk = find(class, "mk", "(I)[I");
        let result = processor::invoke_list(
            t,
            mk,
            core::ptr::null_mut(),
            &[InvokeArg::Int(4)],
        )
        .expect("allocation");
        let array = result as *mut RawArray;
        assert_eq!((*array).length, 4);
        assert_eq!((*array).class, machine.specials.int_array);

        let result = processor::invoke_list(
            t,
            mk,
            core::ptr::null_mut(),
            &[InvokeArg::Int(-1)],
        );
        assert!(result.is_none());
        assert_eq!(pending_class(t), machine.specials.negative_array_size);
    }
}

#[test]
fn narrowing_conversions() {
    let (machine, t) = setup();
    let class = ClassBuilder::new(&machine, "Narrow")
        .extends(machine.specials.object)
        .method(
            "b",
            "(I)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ILOAD_0, op::I2B, op::IRETURN],
                1,
            )),
        )
        .method(
            "c",
            "(I)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ILOAD_0, op::I2C, op::IRETURN],
                1,
            )),
        )
        .method(
            "s",
            "(I)I",
            MethodFlags::STATIC,
            MethodCode::Bytecode(CodeRecord::new(
                vec![op::ILOAD_0, op::I2S, op::IRETURN],
                1,
            )),
        )
        .build();

    unsafe {
        let cases = [
            ("b", 0x180, -128),
            ("b", 0x7F, 127),
            ("c", -1, 0xFFFF),
            ("s", 0x1_8000, -32768),
        ];
        for (name, input, expected) in cases {
            let method = find(class, name, "(I)I");
            let result = processor::invoke_list(
                t,
                method,
                core::ptr::null_mut(),
                &[InvokeArg::Int(input)],
            )
            .expect("conversion");
            assert_eq!(int_value(result), expected, "{name}({input:#x})");
        }
    }
}

#[test]
fn getfield_null_faults_and_handler_catches() {
    let (machine, t) = setup();
    let node_class = ClassBuilder::new(&machine, "Node")
        .extends(machine.specials.object)
        .instance_field("x", object::FieldCode::Int)
        .build();

    unsafe {
        let x_field = Class::find_field(node_class, "x").expect("field x");

        let class = ClassBuilder::new(&machine, "E3")
            .extends(machine.specials.object)
            .method(
                "f",
                "(LNode;)I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::ALOAD_0, op::GETFIELD, 0x00, 0x01, op::IRETURN],
                    1,
                )),
            )
            .method(
                "outer",
                "(LNode;)I",
                MethodFlags::STATIC,
                MethodCode::Bytecode({
                    let mut record = CodeRecord::new(
                        vec![
                            op::ALOAD_0,
                            op::INVOKESTATIC,
                            0x00,
                            0x02,
                            op::IRETURN,
                            op::ASTORE_1,
                            op::ICONST_M1,
                            op::IRETURN,
                        ],
                        2,
                    );
                    record.handlers.push(HandlerEntry {
                        start: 0,
                        end: 5,
                        handler: 5,
                        catch_type: 3,
                    });
                    record
                }),
            )
            .build();

        bootstrap::pool_field(class, x_field); // #1
        let f = find(class, "f", "(LNode;)I");
        bootstrap::pool_method(class, f); // #2
        bootstrap::pool_class(class, machine.specials.null_pointer); // #3

        let node = new_instance(&machine, node_class);
        *(node as *mut usize).add(1) = 42;

        let result = processor::invoke_list(
            t,
            f,
            core::ptr::null_mut(),
            &[InvokeArg::Object(node)],
        )
        .expect("field read");
        assert_eq!(int_value(result), 42);

        // a bare call with null leaves the exception pending
        let result = processor::invoke_list(
            t,
            f,
            core::ptr::null_mut(),
            &[InvokeArg::Object(core::ptr::null_mut())],
        );
        assert!(result.is_none());
        assert_eq!(pending_class(t), machine.specials.null_pointer);

        // through a frame with a matching handler, control resumes there
        let outer = find(class, "outer", "(LNode;)I");
        let result = processor::invoke_list(
            t,
            outer,
            core::ptr::null_mut(),
            &[InvokeArg::Object(node)],
        )
        .expect("non-null path");
        assert_eq!(int_value(result), 42);

        let result = processor::invoke_list(
            t,
            outer,
            core::ptr::null_mut(),
            &[InvokeArg::Object(core::ptr::null_mut())],
        )
        .expect("handler path");
        assert_eq!(int_value(result), -1);
        assert!((*t).exception.is_null());
    }
}

#[test]
fn lazy_compilation_patches_the_call_site() {
    let (machine, t) = setup();
    unsafe {
        let b_class = ClassBuilder::new(&machine, "B")
            .extends(machine.specials.object)
            .method(
                "m",
                "()I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::BIPUSH, 42, op::IRETURN],
                    0,
                )),
            )
            .build();
        let b_m = find(b_class, "m", "()I");

        let a_class = ClassBuilder::new(&machine, "A")
            .extends(machine.specials.object)
            .method(
                "caller",
                "()I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::INVOKESTATIC, 0x00, 0x01, op::IRETURN],
                    0,
                )),
            )
            .build();
        bootstrap::pool_method(a_class, b_m); // #1
        let caller = find(a_class, "caller", "()I");

        // compiling the caller must not touch the callee
        runtime::compile_method2(t, caller);
        assert!((*t).exception.is_null());
        assert_eq!((*b_m).code_entry, machine.method_stub_entry());

        let result = processor::invoke_list(
            t,
            caller,
            core::ptr::null_mut(),
            &[],
        )
        .expect("first call");
        assert_eq!(int_value(result), 42);
        assert_ne!((*b_m).code_entry, machine.method_stub_entry());

        // the caller's immediate now holds the compiled entry, on a
        // word boundary so the rewrite was a single store
        let code = (*caller).compiled.as_ref().expect("compiled").code();
        let base = code.as_ptr() as usize;
        let mut patched = false;
        for i in 0..code.len().saturating_sub(11) {
            if code[i] == 0x48
                && code[i + 1] == 0xB8
                && code[i + 10] == 0xFF
                && code[i + 11] == 0xD0
            {
                let imm_address = base + i + 2;
                assert_eq!(imm_address % WORD, 0);
                let imm = (imm_address as *const usize).read();
                if imm == (*b_m).code_entry as usize {
                    patched = true;
                }
            }
        }
        assert!(patched, "call site still holds the stub");

        // the second call goes straight to compiled code
        let stub_calls =
            machine.stub_calls.load(std::sync::atomic::Ordering::SeqCst);
        let result = processor::invoke_list(
            t,
            caller,
            core::ptr::null_mut(),
            &[],
        )
        .expect("second call");
        assert_eq!(int_value(result), 42);
        assert_eq!(
            machine.stub_calls.load(std::sync::atomic::Ordering::SeqCst),
            stub_calls
        );
    }
}

#[test]
fn recursion_through_the_stub() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Fib")
            .extends(machine.specials.object)
            .method(
                "fib",
                "(I)I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![
                        op::ILOAD_0,
                        op::ICONST_2,
                        op::IF_ICMPGE,
                        0x00,
                        0x05,
                        op::ILOAD_0,
                        op::IRETURN,
                        op::ILOAD_0,
                        op::ICONST_1,
                        op::ISUB,
                        op::INVOKESTATIC,
                        0x00,
                        0x01,
                        op::ILOAD_0,
                        op::ICONST_2,
                        op::ISUB,
                        op::INVOKESTATIC,
                        0x00,
                        0x01,
                        op::IADD,
                        op::IRETURN,
                    ],
                    1,
                )),
            )
            .build();
        let fib = find(class, "fib", "(I)I");
        bootstrap::pool_method(class, fib); // #1

        let result = processor::invoke_list(
            t,
            fib,
            core::ptr::null_mut(),
            &[InvokeArg::Int(12)],
        )
        .expect("fib");
        assert_eq!(int_value(result), 144);
    }
}

unsafe extern "C" fn host_add(
    _t: *mut Thread,
    _class: *mut *mut Class,
    a: i32,
    b: i32,
) -> i32 {
    a.wrapping_add(b)
}

#[test]
fn native_method_through_libffi() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Host")
            .extends(machine.specials.object)
            .method(
                "sqrt",
                "(D)D",
                MethodFlags::STATIC,
                MethodCode::NativeName(b"sqrt".to_vec()),
            )
            .method(
                "hadd",
                "(II)I",
                MethodFlags::STATIC,
                MethodCode::NativePointer(
                    host_add as *const core::ffi::c_void,
                ),
            )
            .method(
                "missing",
                "()V",
                MethodFlags::STATIC,
                MethodCode::NativeName(b"definitely_not_a_symbol".to_vec()),
            )
            .build();

        let frame_before = (*t).frame;
        let reference_before = (*t).reference;

        let sqrt = find(class, "sqrt", "(D)D");
        let result = processor::invoke_list(
            t,
            sqrt,
            core::ptr::null_mut(),
            &[InvokeArg::Double(16.0)],
        )
        .expect("sqrt");
        assert_eq!((*(result as *mut DoubleObject)).value, 4.0);

        assert_eq!((*t).frame, frame_before);
        assert_eq!((*t).reference, reference_before);

        let hadd = find(class, "hadd", "(II)I");
        let result = processor::invoke_list(
            t,
            hadd,
            core::ptr::null_mut(),
            &[InvokeArg::Int(30), InvokeArg::Int(12)],
        )
        .expect("hadd");
        assert_eq!(int_value(result), 42);

        let missing = find(class, "missing", "()V");
        let result =
            processor::invoke_list(t, missing, core::ptr::null_mut(), &[]);
        assert!(result.is_none());
        assert_eq!(pending_class(t), machine.specials.unsatisfied_link);
    }
}

#[test]
fn nested_handlers_select_by_range_order() {
    let (machine, t) = setup();
    unsafe {
        let io_error = ClassBuilder::new(&machine, "IoError")
            .extends(machine.specials.exception)
            .build();

        let class = ClassBuilder::new(&machine, "E6")
            .extends(machine.specials.object)
            .method(
                "m",
                "()I",
                MethodFlags::STATIC,
                MethodCode::Bytecode({
                    let mut record = CodeRecord::new(
                        vec![
                            op::NEW,
                            0x00,
                            0x01,
                            op::ATHROW,
                            op::ASTORE_0,
                            op::ICONST_1,
                            op::IRETURN,
                            op::ASTORE_0,
                            op::ICONST_2,
                            op::IRETURN,
                        ],
                        1,
                    );
                    // the inner, more specific handler comes first
                    record.handlers.push(HandlerEntry {
                        start: 0,
                        end: 4,
                        handler: 4,
                        catch_type: 1,
                    });
                    record.handlers.push(HandlerEntry {
                        start: 0,
                        end: 4,
                        handler: 7,
                        catch_type: 2,
                    });
                    record
                }),
            )
            .build();
        bootstrap::pool_class(class, io_error); // #1
        bootstrap::pool_class(class, machine.specials.exception); // #2

        let m = find(class, "m", "()I");
        let result =
            processor::invoke_list(t, m, core::ptr::null_mut(), &[])
                .expect("handled");
        assert_eq!(int_value(result), 1, "inner handler must win");
        assert!((*t).exception.is_null());
    }
}

#[test]
fn athrow_of_null_raises_null_pointer() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "ThrowNull")
            .extends(machine.specials.object)
            .method(
                "m",
                "()V",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::ACONST_NULL, op::ATHROW],
                    0,
                )),
            )
            .build();
        let m = find(class, "m", "()V");
        let result =
            processor::invoke_list(t, m, core::ptr::null_mut(), &[]);
        assert!(result.is_none());
        assert_eq!(pending_class(t), machine.specials.null_pointer);
    }
}

#[test]
fn instanceof_and_checkcast() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Types")
            .extends(machine.specials.object)
            .method(
                "isString",
                "(Ljava/lang/Object;)I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::ALOAD_0, op::INSTANCEOF, 0x00, 0x01, op::IRETURN],
                    1,
                )),
            )
            .method(
                "castString",
                "(Ljava/lang/Object;)Ljava/lang/Object;",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::ALOAD_0, op::CHECKCAST, 0x00, 0x01, op::ARETURN],
                    1,
                )),
            )
            .build();
        bootstrap::pool_class(class, machine.specials.string); // #1

        let is_string =
            find(class, "isString", "(Ljava/lang/Object;)I");
        let string = machine.allocate_string("hello") as *mut Object;
        let boxed = new_instance(&machine, machine.specials.int_box);

        for (value, expected) in [
            (string, 1),
            (boxed, 0),
            (core::ptr::null_mut(), 0),
        ] {
            let result = processor::invoke_list(
                t,
                is_string,
                core::ptr::null_mut(),
                &[InvokeArg::Object(value)],
            )
            .expect("instanceof");
            assert_eq!(int_value(result), expected);
        }

        let cast = find(
            class,
            "castString",
            "(Ljava/lang/Object;)Ljava/lang/Object;",
        );
        let result = processor::invoke_list(
            t,
            cast,
            core::ptr::null_mut(),
            &[InvokeArg::Object(string)],
        )
        .expect("cast succeeds");
        assert_eq!(result, string);

        // null passes a checkcast untouched
        let result = processor::invoke_list(
            t,
            cast,
            core::ptr::null_mut(),
            &[InvokeArg::Object(core::ptr::null_mut())],
        )
        .expect("null passes");
        assert!(result.is_null());

        let result = processor::invoke_list(
            t,
            cast,
            core::ptr::null_mut(),
            &[InvokeArg::Object(boxed)],
        );
        assert!(result.is_none());
        assert_eq!(pending_class(t), machine.specials.class_cast);
    }
}

#[test]
fn virtual_dispatch_uses_the_receiver_class() {
    let (machine, t) = setup();
    unsafe {
        let animal = ClassBuilder::new(&machine, "Animal")
            .extends(machine.specials.object)
            .method(
                "speak",
                "()I",
                MethodFlags::empty(),
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::ICONST_1, op::IRETURN],
                    1,
                )),
            )
            .build();
        let dog = ClassBuilder::new(&machine, "Dog")
            .extends(animal)
            .method(
                "speak",
                "()I",
                MethodFlags::empty(),
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::ICONST_2, op::IRETURN],
                    1,
                )),
            )
            .build();

        let caller = ClassBuilder::new(&machine, "Caller")
            .extends(machine.specials.object)
            .method(
                "call",
                "(LAnimal;)I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![
                        op::ALOAD_0,
                        op::INVOKEVIRTUAL,
                        0x00,
                        0x01,
                        op::IRETURN,
                    ],
                    1,
                )),
            )
            .build();
        let animal_speak = find(animal, "speak", "()I");
        bootstrap::pool_method(caller, animal_speak); // #1
        let call = find(caller, "call", "(LAnimal;)I");

        let a = new_instance(&machine, animal);
        let d = new_instance(&machine, dog);

        let result = processor::invoke_list(
            t,
            call,
            core::ptr::null_mut(),
            &[InvokeArg::Object(a)],
        )
        .expect("animal");
        assert_eq!(int_value(result), 1);

        let result = processor::invoke_list(
            t,
            call,
            core::ptr::null_mut(),
            &[InvokeArg::Object(d)],
        )
        .expect("dog");
        assert_eq!(int_value(result), 2);
    }
}

#[test]
fn private_calls_dispatch_directly() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Priv")
            .extends(machine.specials.object)
            .method(
                "helper",
                "()I",
                MethodFlags::PRIVATE,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::ICONST_5, op::IRETURN],
                    1,
                )),
            )
            .method(
                "call",
                "()I",
                MethodFlags::empty(),
                MethodCode::Bytecode(CodeRecord::new(
                    vec![
                        op::ALOAD_0,
                        op::INVOKESPECIAL,
                        0x00,
                        0x01,
                        op::IRETURN,
                    ],
                    1,
                )),
            )
            .build();
        let helper = find(class, "helper", "()I");
        bootstrap::pool_method(class, helper); // #1

        let call = find(class, "call", "()I");
        let receiver = new_instance(&machine, class);
        let result = processor::invoke_list(
            t,
            call,
            receiver,
            &[],
        )
        .expect("private call");
        assert_eq!(int_value(result), 5);
    }
}

#[test]
fn statics_run_the_initializer_once() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "S")
            .extends(machine.specials.object)
            .static_field("counter", object::FieldCode::Int)
            .method(
                "<clinit>",
                "()V",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![
                        op::BIPUSH,
                        7,
                        op::PUTSTATIC,
                        0x00,
                        0x01,
                        op::RETURN,
                    ],
                    0,
                )),
            )
            .method(
                "get",
                "()I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::GETSTATIC, 0x00, 0x01, op::IRETURN],
                    0,
                )),
            )
            .method(
                "bump",
                "()I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![
                        op::GETSTATIC,
                        0x00,
                        0x01,
                        op::ICONST_1,
                        op::IADD,
                        op::PUTSTATIC,
                        0x00,
                        0x01,
                        op::GETSTATIC,
                        0x00,
                        0x01,
                        op::IRETURN,
                    ],
                    0,
                )),
            )
            .build();
        let counter = Class::find_field(class, "counter").expect("counter");
        bootstrap::pool_field(class, counter); // #1

        let get = find(class, "get", "()I");
        let result =
            processor::invoke_list(t, get, core::ptr::null_mut(), &[])
                .expect("get");
        assert_eq!(int_value(result), 7, "initializer must have run");

        let bump = find(class, "bump", "()I");
        for expected in [8, 9, 10] {
            let result = processor::invoke_list(
                t,
                bump,
                core::ptr::null_mut(),
                &[],
            )
            .expect("bump");
            assert_eq!(int_value(result), expected);
        }
    }
}

#[test]
fn ldc_loads_ints_floats_and_strings() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Consts")
            .extends(machine.specials.object)
            .method(
                "big",
                "()I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::LDC, 0x01, op::IRETURN],
                    0,
                )),
            )
            .method(
                "pi",
                "()F",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::LDC, 0x02, op::FRETURN],
                    0,
                )),
            )
            .method(
                "greeting",
                "()Ljava/lang/String;",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::LDC, 0x03, op::ARETURN],
                    0,
                )),
            )
            .build();
        bootstrap::pool_int(class, 1_000_000); // #1
        bootstrap::pool_float(class, 3.5); // #2
        bootstrap::pool_string(&machine, class, "hello"); // #3

        let big = find(class, "big", "()I");
        let result =
            processor::invoke_list(t, big, core::ptr::null_mut(), &[])
                .expect("big");
        assert_eq!(int_value(result), 1_000_000);

        let pi = find(class, "pi", "()F");
        let result =
            processor::invoke_list(t, pi, core::ptr::null_mut(), &[])
                .expect("pi");
        assert_eq!((*(result as *mut FloatObject)).value, 3.5);

        let greeting =
            find(class, "greeting", "()Ljava/lang/String;");
        let string =
            processor::invoke_list(t, greeting, core::ptr::null_mut(), &[])
                .expect("greeting");
        assert!(!string.is_null());

        // the string is a pool root, visible to the collector
        let mut seen = false;
        processor::visit_objects(t, &mut |obj| {
            if obj == string {
                seen = true;
            }
        });
        assert!(seen, "pool constant must be enumerated as a root");
    }
}

#[test]
fn unresolved_pool_entry_aborts_compilation() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Broken")
            .extends(machine.specials.object)
            .method(
                "m",
                "()V",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::NEW, 0x00, 0x01, op::POP, op::RETURN],
                    0,
                )),
            )
            .build();
        bootstrap::pool_unresolved(class, "gone/Missing"); // #1

        let m = find(class, "m", "()V");
        let result =
            processor::invoke_list(t, m, core::ptr::null_mut(), &[]);
        assert!(result.is_none());
        assert_eq!(pending_class(t), machine.specials.no_class_def);
        // the failed compile left the stub in place
        assert_eq!((*m).code_entry, machine.method_stub_entry());
    }
}

unsafe extern "C" fn count_frames(
    t: *mut Thread,
    _class: *mut *mut Class,
) -> i32 {
    let mut count = 0;
    let mut frame = processor::frame_start(t);
    while processor::frame_valid(frame) {
        let method = processor::frame_method(frame);
        if !(*method).is_native() {
            // the suspended address must map into the method's code
            let ip = processor::frame_ip(t, frame);
            let len = (*method)
                .compiled
                .as_ref()
                .expect("compiled frame")
                .code_len();
            assert!(ip <= len);
        }
        count += 1;
        frame = processor::frame_next(frame);
    }
    count
}

#[test]
fn frame_walk_terminates_and_maps_ips() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Walker")
            .extends(machine.specials.object)
            .method(
                "probe",
                "()I",
                MethodFlags::STATIC,
                MethodCode::NativePointer(
                    count_frames as *const core::ffi::c_void,
                ),
            )
            .method(
                "nest",
                "()I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![op::INVOKESTATIC, 0x00, 0x01, op::IRETURN],
                    0,
                )),
            )
            .build();
        let probe = find(class, "probe", "()I");
        bootstrap::pool_method(class, probe); // #1

        let nest = find(class, "nest", "()I");
        let result =
            processor::invoke_list(t, nest, core::ptr::null_mut(), &[])
                .expect("walk");
        // the native probe frame plus its compiled caller
        assert_eq!(int_value(result), 2);
    }
}

unsafe extern "C" fn leak_references(
    t: *mut Thread,
    class: *mut *mut Class,
) -> i32 {
    for _ in 0..5 {
        processor::make_local_reference(t, *class as *mut Object);
    }
    0
}

#[test]
fn invoke_releases_leaked_local_references() {
    let (machine, t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Leaky")
            .extends(machine.specials.object)
            .method(
                "leak",
                "()I",
                MethodFlags::STATIC,
                MethodCode::NativePointer(
                    leak_references as *const core::ffi::c_void,
                ),
            )
            .build();
        let leak = find(class, "leak", "()I");

        let reference_before = (*t).reference;
        let frame_before = (*t).frame;
        processor::invoke_list(t, leak, core::ptr::null_mut(), &[])
            .expect("leak");
        assert_eq!((*t).reference, reference_before);
        assert_eq!((*t).frame, frame_before);
    }
}

#[test]
fn concurrent_first_calls_compile_once() {
    let (machine, _t) = setup();
    unsafe {
        let class = ClassBuilder::new(&machine, "Race")
            .extends(machine.specials.object)
            .method(
                "sum",
                "(I)I",
                MethodFlags::STATIC,
                MethodCode::Bytecode(CodeRecord::new(
                    vec![
                        op::ICONST_0,
                        op::ISTORE_1,
                        op::ICONST_1,
                        op::ISTORE_2,
                        op::ILOAD_2,
                        op::ILOAD_0,
                        op::IF_ICMPGT,
                        0x00,
                        0x0D,
                        op::ILOAD_1,
                        op::ILOAD_2,
                        op::IADD,
                        op::ISTORE_1,
                        op::IINC,
                        0x02,
                        0x01,
                        op::GOTO,
                        0xFF,
                        0xF4,
                        op::ILOAD_1,
                        op::IRETURN,
                    ],
                    3,
                )),
            )
            .build();
        let sum = find(class, "sum", "(I)I");
        let machine_ref: &Machine = &machine;
        let sum_addr = sum as usize;

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..4 {
                handles.push(scope.spawn(move || {
                    let t = machine_ref.make_thread(
                        core::ptr::null_mut(),
                        core::ptr::null_mut(),
                    );
                    let sum = sum_addr as *mut Method;
                    let result = processor::invoke_list(
                        t,
                        sum,
                        core::ptr::null_mut(),
                        &[InvokeArg::Int(100)],
                    )
                    .expect("concurrent sum");
                    (int_value(result), (*sum).code_entry as usize)
                }));
            }
            let outcomes: Vec<(i32, usize)> =
                handles.into_iter().map(|h| h.join().expect("join")).collect();
            for (value, entry) in &outcomes {
                assert_eq!(*value, 5050);
                assert_eq!(*entry, outcomes[0].1);
            }
        });

        assert!((*sum).compiled.is_some());
        assert_ne!(
            (*sum).code_entry,
            machine.method_stub_entry(),
            "entry must be the single published record"
        );
    }
}
