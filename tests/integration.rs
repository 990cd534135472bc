//! End-to-end scenarios and cross-cutting invariant/round-trip checks,
//! built from hand-written pickle byte streams rather than a real PyTorch
//! checkpoint.

use std::io::Cursor;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;

use unpickle_vm::archive::storage::StorageLoader;
use unpickle_vm::archive::CheckpointArchive;
use unpickle_vm::byte_source::SliceSource;
use unpickle_vm::registry::{HostTensor, Instantiator, InstantiatorRegistry};
use unpickle_vm::value::{Value, ValueMap};
use unpickle_vm::{unpickle, PickleError, Unpickler};

use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// A tiny hand-rolled pickle *writer*, used only to build test fixtures.
/// Grounded on the teacher's `ChunkBuilder`: a thin wrapper around a byte
/// buffer with one method per opcode shape, chainable via `&mut Self`.
#[derive(Default)]
struct PickleWriter {
    buf: Vec<u8>,
}

impl PickleWriter {
    fn new() -> Self {
        Self::default()
    }

    fn bytes(self) -> Vec<u8> {
        self.buf
    }

    fn raw(&mut self, b: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(b);
        self
    }

    fn op(&mut self, b: u8) -> &mut Self {
        self.buf.push(b);
        self
    }

    fn proto(&mut self, v: u8) -> &mut Self {
        self.op(0x80);
        self.raw(&[v])
    }

    fn stop(&mut self) -> &mut Self {
        self.op(0x2e)
    }

    fn mark(&mut self) -> &mut Self {
        self.op(0x28)
    }

    fn none(&mut self) -> &mut Self {
        self.op(0x4e)
    }

    fn newtrue(&mut self) -> &mut Self {
        self.op(0x88)
    }

    fn newfalse(&mut self) -> &mut Self {
        self.op(0x89)
    }

    fn binint(&mut self, v: i32) -> &mut Self {
        self.op(0x4a);
        self.raw(&v.to_le_bytes())
    }

    fn binint1(&mut self, v: u8) -> &mut Self {
        self.op(0x4b);
        self.raw(&[v])
    }

    fn binint2(&mut self, v: u16) -> &mut Self {
        self.op(0x4d);
        self.raw(&v.to_le_bytes())
    }

    fn int_ascii(&mut self, v: i128) -> &mut Self {
        self.op(0x49);
        self.buf.extend_from_slice(v.to_string().as_bytes());
        self.buf.push(b'\n');
        self
    }

    fn long1(&mut self, le_bytes: &[u8]) -> &mut Self {
        self.op(0x8a);
        self.raw(&[le_bytes.len() as u8]);
        self.raw(le_bytes)
    }

    fn binfloat(&mut self, v: f64) -> &mut Self {
        self.op(0x47);
        self.raw(&v.to_be_bytes())
    }

    fn short_binunicode(&mut self, s: &str) -> &mut Self {
        self.op(0x8c);
        self.raw(&[s.len() as u8]);
        self.raw(s.as_bytes())
    }

    fn binunicode(&mut self, s: &str) -> &mut Self {
        self.op(0x58);
        self.raw(&(s.len() as u32).to_le_bytes());
        self.raw(s.as_bytes())
    }

    fn short_binbytes(&mut self, b: &[u8]) -> &mut Self {
        self.op(0x43);
        self.raw(&[b.len() as u8]);
        self.raw(b)
    }

    fn empty_tuple(&mut self) -> &mut Self {
        self.op(0x29)
    }

    fn empty_list(&mut self) -> &mut Self {
        self.op(0x5d)
    }

    fn empty_dict(&mut self) -> &mut Self {
        self.op(0x7d)
    }

    fn empty_set(&mut self) -> &mut Self {
        self.op(0x8f)
    }

    fn tuple(&mut self) -> &mut Self {
        self.op(0x74)
    }

    fn tuple2(&mut self) -> &mut Self {
        self.op(0x86)
    }

    fn list_op(&mut self) -> &mut Self {
        self.op(0x6c)
    }

    fn dict_op(&mut self) -> &mut Self {
        self.op(0x64)
    }

    fn frozenset(&mut self) -> &mut Self {
        self.op(0x91)
    }

    fn appends(&mut self) -> &mut Self {
        self.op(0x65)
    }

    fn setitem(&mut self) -> &mut Self {
        self.op(0x73)
    }

    fn additems(&mut self) -> &mut Self {
        self.op(0x90)
    }

    fn global(&mut self, module: &str, qualname: &str) -> &mut Self {
        self.op(0x63);
        self.buf.extend_from_slice(module.as_bytes());
        self.buf.push(b'\n');
        self.buf.extend_from_slice(qualname.as_bytes());
        self.buf.push(b'\n');
        self
    }

    fn reduce(&mut self) -> &mut Self {
        self.op(0x52)
    }

    fn newobj(&mut self) -> &mut Self {
        self.op(0x81)
    }

    fn build(&mut self) -> &mut Self {
        self.op(0x62)
    }

    fn binpersid(&mut self) -> &mut Self {
        self.op(0x51)
    }

    fn binget(&mut self, idx: u8) -> &mut Self {
        self.op(0x68);
        self.raw(&[idx])
    }

    fn binput(&mut self, idx: u8) -> &mut Self {
        self.op(0x71);
        self.raw(&[idx])
    }

    fn frame(&mut self, len: u64) -> &mut Self {
        self.op(0x95);
        self.raw(&len.to_le_bytes())
    }
}

fn build_zip(entries: &[(&str, &[u8])], data_pkl: &[u8], byteorder: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut writer = ZipWriter::new(Cursor::new(&mut buf));
        let opts = SimpleFileOptions::default();
        writer.start_file("archive/data.pkl", opts).unwrap();
        writer.write_all(data_pkl).unwrap();
        writer.start_file("archive/byteorder", opts).unwrap();
        writer.write_all(byteorder.as_bytes()).unwrap();
        for (key, bytes) in entries {
            writer
                .start_file(format!("archive/data/{}", key), opts)
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }
    buf
}

fn run_against_archive(data_pkl: &[u8], zip_bytes: Vec<u8>) -> unpickle_vm::Result<Value> {
    let archive = CheckpointArchive::open(Cursor::new(zip_bytes)).unwrap();
    let mut loader = StorageLoader::new(archive);
    let mut vm = Unpickler::new(SliceSource::new(data_pkl));
    vm.set_persistent_load(loader.as_persistent_load());
    vm.run()
}

/// Emits the PyTorch persistent-id tuple `("storage", <StorageClass>,
/// <key>, "cpu", <numel>)` for a given storage module/class tag.
fn storage_pid(w: &mut PickleWriter, storage_class: &str, key: &str, numel: i64) {
    w.mark();
    w.short_binunicode("storage");
    w.global("torch", storage_class);
    w.short_binunicode(key);
    w.short_binunicode("cpu");
    w.binint(numel as i32);
    w.tuple();
}

/// Emits `_rebuild_tensor_v2(storage_pid, offset, shape, stride, False,
/// OrderedDict())`, leaving the reconstructed tensor on the stack.
fn rebuild_tensor(w: &mut PickleWriter, storage_class: &str, key: &str, numel: i64, offset: i64) {
    w.global("torch._utils", "_rebuild_tensor_v2");
    w.mark();
    storage_pid(w, storage_class, key, numel);
    w.binpersid();
    w.binint(offset as i32);
    w.mark();
    w.binint(numel as i32);
    w.tuple();
    w.mark();
    w.binint1(1);
    w.tuple();
    w.newfalse();
    w.global("collections", "OrderedDict");
    w.empty_tuple();
    w.newobj();
    w.tuple();
    w.reduce();
}

// ---- Scenario 1: minimal single-tensor file ----

#[test]
fn scenario_minimal_single_tensor_file() {
    let mut w = PickleWriter::new();
    w.proto(2);
    rebuild_tensor(&mut w, "ByteStorage", "0", 65536, 0);
    w.stop();
    let data_pkl = w.bytes();

    let storage_bytes = vec![7u8; 65536];
    let zip = build_zip(&[("0", &storage_bytes)], &data_pkl, "little");

    let result = run_against_archive(&data_pkl, zip).unwrap();
    let obj = result.as_object().expect("tensor is an Object");
    assert_eq!(obj.type_tag.as_ref(), "Tensor");
    let tensor = obj.downcast_ref::<HostTensor>().expect("HostTensor payload");
    assert_eq!(tensor.shape, vec![65536]);
    assert_eq!(tensor.bytes.len(), 65536);
    assert!(tensor.bytes.iter().all(|b| *b == 7));
}

// ---- Scenario 2: custom-registered handler (tokenizer-like object) ----

struct TiktokenHandler;

impl Instantiator for TiktokenHandler {
    fn create(&self) -> Value {
        Value::Object(unpickle_vm::value::ObjectValue::new(
            "TiktokenEncoding",
            Rc::new(std::cell::RefCell::new(ValueMap::new())),
        ))
    }

    fn initialize(&self, object: Value, arguments: Value) -> unpickle_vm::Result<Value> {
        let payload = object
            .as_object()
            .unwrap()
            .downcast_ref::<std::cell::RefCell<ValueMap>>()
            .unwrap();
        if let Some(state) = arguments.as_dict() {
            for (k, v) in state.borrow().iter() {
                payload.borrow_mut().insert(k.clone(), v.clone());
            }
        }
        Ok(object)
    }
}

#[test]
fn scenario_custom_handler_tokenizer_encoding() {
    let registry = InstantiatorRegistry::new();
    registry.add(
        "tiktoken_ext.TiktokenEncoding",
        "TiktokenEncoding",
        Arc::new(TiktokenHandler),
    );

    let mut w = PickleWriter::new();
    w.proto(2);
    w.global("tiktoken_ext", "TiktokenEncoding");
    w.empty_dict();

    w.short_binunicode("name");
    w.short_binunicode("cl100k_base");
    w.setitem();

    w.short_binunicode("mergeable_ranks");
    w.mark();
    for i in 0..65527i32 {
        w.binint(i);
        w.binint(i);
    }
    w.dict_op();
    w.setitem();

    w.short_binunicode("special_tokens");
    w.mark();
    for i in 0..9i32 {
        w.short_binunicode(&format!("<special_{}>", i));
        w.binint(100_000 + i);
    }
    w.dict_op();
    w.setitem();

    w.short_binunicode("pat_str");
    w.short_binunicode("(?i:pattern)");
    w.setitem();

    w.build();
    w.stop();
    let data_pkl = w.bytes();

    let mut vm = Unpickler::with_registry_and_options(
        SliceSource::new(&data_pkl),
        registry,
        unpickle_vm::UnpicklerOptions::default(),
    );
    let result = vm.run().unwrap();
    let obj = result.as_object().unwrap();
    assert_eq!(obj.type_tag.as_ref(), "TiktokenEncoding");
    let payload = obj
        .downcast_ref::<std::cell::RefCell<ValueMap>>()
        .unwrap()
        .borrow();
    assert_eq!(
        payload.get(&Value::string("name").into_key().unwrap()),
        Some(&Value::string("cl100k_base"))
    );
    let ranks = payload
        .get(&Value::string("mergeable_ranks").into_key().unwrap())
        .unwrap()
        .as_dict()
        .unwrap();
    assert_eq!(ranks.borrow().len(), 65527);
    let specials = payload
        .get(&Value::string("special_tokens").into_key().unwrap())
        .unwrap()
        .as_dict()
        .unwrap();
    assert_eq!(specials.borrow().len(), 9);
    assert_eq!(
        payload.get(&Value::string("pat_str").into_key().unwrap()),
        Some(&Value::string("(?i:pattern)"))
    );
}

// ---- Scenario 3: checkpoint dict with 122 tensors + _metadata ----

#[test]
fn scenario_checkpoint_dict_of_tensors_and_metadata() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.empty_dict();

    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    for i in 0..122 {
        let key = format!("t{}", i);
        w.short_binunicode(&format!("layer.{}.weight", i));
        rebuild_tensor(&mut w, "FloatStorage", &key, 4, 0);
        w.setitem();
        entries.push((key, vec![0u8; 16]));
    }

    w.short_binunicode("_metadata");
    w.empty_dict();
    w.short_binunicode("version");
    w.binint(1);
    w.setitem();
    w.setitem();
    w.stop();
    let data_pkl = w.bytes();

    let entry_refs: Vec<(&str, &[u8])> = entries
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_slice()))
        .collect();
    let zip = build_zip(&entry_refs, &data_pkl, "little");

    let result = run_against_archive(&data_pkl, zip).unwrap();
    let dict = result.as_dict().unwrap().borrow();
    assert_eq!(dict.len(), 123);

    let mut tensor_count = 0;
    let mut metadata_seen = false;
    for (k, v) in dict.iter() {
        if k.value().as_str() == Some("_metadata") {
            metadata_seen = true;
            assert!(v.as_dict().is_some());
        } else if let Some(obj) = v.as_object() {
            assert_eq!(obj.type_tag.as_ref(), "Tensor");
            tensor_count += 1;
        }
    }
    assert_eq!(tensor_count, 122);
    assert!(metadata_seen);
}

// ---- Scenario 4: absent persistent loader ----

#[test]
fn scenario_absent_persistent_loader_yields_none() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.short_binunicode("storage-ref-with-no-loader-installed");
    w.binpersid();
    w.stop();
    let bytes = w.bytes();

    assert_eq!(unpickle(&bytes).unwrap(), Value::None);
}

// ---- Scenario 5: frame boundary violation ----

#[test]
fn scenario_frame_boundary_violation() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.frame(16);
    for _ in 0..10 {
        w.mark(); // 10 one-byte opcodes, well short of the declared 16
    }
    w.frame(8); // still 6 bytes left in the first frame: must error
    let bytes = w.bytes();

    assert_eq!(unpickle(&bytes), Err(PickleError::UnexpectedFrameState));
}

// ---- Scenario 6: unknown opcode ----

#[test]
fn scenario_unknown_opcode_after_proto5() {
    let mut w = PickleWriter::new();
    w.proto(5);
    w.op(0x01); // unassigned byte
    let bytes = w.bytes();

    assert_eq!(unpickle(&bytes), Err(PickleError::UnknownOpcode(0x01)));
}

// ---- Invariants & round-trip properties (spec.md §8) ----

#[test]
fn mark_never_appears_in_the_final_result() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.empty_list();
    w.mark();
    w.binint1(1);
    w.binint1(2);
    w.appends();
    w.stop();
    let result = unpickle(&w.bytes()).unwrap();
    let list = result.as_list().unwrap().borrow();
    assert!(list.iter().all(|v| !v.is_mark()));
}

#[test]
fn memoize_then_get_preserves_reference_identity() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.empty_list();
    w.binput(0);
    w.binget(0);
    w.tuple2();
    w.stop();
    let result = unpickle(&w.bytes()).unwrap();
    let pair = result.as_tuple().unwrap();
    let (Value::List(a), Value::List(b)) = (&pair[0], &pair[1]) else {
        panic!("expected two lists");
    };
    assert!(Rc::ptr_eq(a, b));
}

#[test]
fn binfloat_round_trips_exact_bit_patterns() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.binfloat(0.0);
    w.stop();
    assert_eq!(unpickle(&w.bytes()).unwrap(), Value::Float(0.0));

    let mut w = PickleWriter::new();
    w.proto(2);
    w.binfloat(1.0);
    w.stop();
    assert_eq!(unpickle(&w.bytes()).unwrap(), Value::Float(1.0));
}

#[test]
fn binint2_decodes_as_unsigned() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.binint2(256);
    w.stop();
    assert_eq!(unpickle(&w.bytes()).unwrap(), Value::Int(256));
}

#[test]
fn long1_decodes_negative_one() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.long1(&[0xff]);
    w.stop();
    assert_eq!(unpickle(&w.bytes()).unwrap(), Value::Int(-1));
}

#[test]
fn dict_with_odd_item_count_drops_trailing_item() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.mark();
    w.short_binunicode("a");
    w.binint1(1);
    w.short_binunicode("b");
    w.binint1(2);
    w.short_binunicode("orphan");
    w.dict_op();
    w.stop();
    let result = unpickle(&w.bytes()).unwrap();
    let dict = result.as_dict().unwrap().borrow();
    assert_eq!(dict.len(), 2);
    assert_eq!(
        dict.get(&Value::string("a").into_key().unwrap()),
        Some(&Value::Int(1))
    );
    assert_eq!(
        dict.get(&Value::string("b").into_key().unwrap()),
        Some(&Value::Int(2))
    );
    assert!(!dict.contains_key(&Value::string("orphan").into_key().unwrap()));
}

#[test]
fn round_trip_primitive_set() {
    type Case = (fn(&mut PickleWriter), Value);
    let cases: &[Case] = &[
        (|w| { w.none(); }, Value::None),
        (|w| { w.newtrue(); }, Value::Bool(true)),
        (|w| { w.newfalse(); }, Value::Bool(false)),
        (|w| { w.binint1(255); }, Value::Int(255)),
        (|w| { w.binint2(256); }, Value::Int(256)),
        (|w| { w.binint(i32::MAX); }, Value::Int(i32::MAX as i128)),
        (|w| { w.int_ascii(-1); }, Value::Int(-1)),
        (|w| { w.int_ascii(0); }, Value::Int(0)),
        (
            |w| {
                w.long1(&(1i128 << 31).to_le_bytes()[..5]);
            },
            Value::Int(1i128 << 31),
        ),
        (|w| { w.binfloat(0.0); }, Value::Float(0.0)),
        (|w| { w.binfloat(-0.0); }, Value::Float(-0.0)),
        (|w| { w.binfloat(f64::INFINITY); }, Value::Float(f64::INFINITY)),
        (|w| { w.binfloat(f64::NEG_INFINITY); }, Value::Float(f64::NEG_INFINITY)),
        (|w| { w.binunicode("héllo wörld 🦀"); }, Value::string("héllo wörld 🦀")),
        (
            |w| {
                w.short_binbytes(&[0, 1, 0, 2]);
            },
            Value::bytes(vec![0, 1, 0, 2]),
        ),
        (|w| { w.empty_list(); }, Value::list(vec![])),
        (|w| { w.empty_dict(); }, Value::empty_dict()),
    ];

    for (write, expected) in cases {
        let mut w = PickleWriter::new();
        w.proto(2);
        write(&mut w);
        w.stop();
        let result = unpickle(&w.bytes()).unwrap();
        assert_eq!(result, *expected, "round-trip mismatch");
    }
}

#[test]
fn round_trip_nan_is_nan_not_equal_to_itself() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.binfloat(f64::NAN);
    w.stop();
    let result = unpickle(&w.bytes()).unwrap();
    assert!(matches!(result, Value::Float(f) if f.is_nan()));
}

#[test]
fn round_trip_nested_three_deep_structure() {
    // [ { "a": (1, 2, [3]) } ]
    let mut w = PickleWriter::new();
    w.proto(2);
    w.empty_list();
    w.mark();
    w.empty_dict();
    w.short_binunicode("a");
    w.mark();
    w.binint1(1);
    w.binint1(2);
    w.mark();
    w.binint1(3);
    w.list_op();
    w.tuple();
    w.setitem();
    w.appends();
    w.stop();

    let result = unpickle(&w.bytes()).unwrap();
    let outer = result.as_list().unwrap().borrow();
    assert_eq!(outer.len(), 1);
    let dict = outer[0].as_dict().unwrap().borrow();
    let inner = dict
        .get(&Value::string("a").into_key().unwrap())
        .unwrap()
        .as_tuple()
        .unwrap();
    assert_eq!(inner[0], Value::Int(1));
    assert_eq!(inner[1], Value::Int(2));
    assert_eq!(
        inner[2].as_list().unwrap().borrow().as_slice(),
        &[Value::Int(3)]
    );
}

#[test]
fn stack_and_metastack_are_empty_after_a_clean_load() {
    // If MARK/pop_mark bookkeeping leaked, a second load on a fresh VM
    // with the same bytes would behave identically; this is a proxy for
    // the stack-empty invariant since the fields are private to `vm`.
    let mut w = PickleWriter::new();
    w.proto(2);
    w.empty_list();
    w.mark();
    w.binint1(1);
    w.appends();
    w.stop();
    let bytes = w.bytes();
    assert_eq!(unpickle(&bytes).unwrap(), unpickle(&bytes).unwrap());
}

#[test]
fn additems_builds_a_set_from_mark_collected_items() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.empty_set();
    w.mark();
    w.binint1(1);
    w.binint1(2);
    w.binint1(1);
    w.additems();
    w.stop();
    let result = unpickle(&w.bytes()).unwrap();
    match result {
        Value::Set(s) => assert_eq!(s.borrow().len(), 2),
        _ => panic!("expected a set"),
    }
}

#[test]
fn frozenset_via_mark_collects_unique_items() {
    let mut w = PickleWriter::new();
    w.proto(2);
    w.mark();
    w.binint1(5);
    w.binint1(5);
    w.binint1(6);
    w.frozenset();
    w.stop();
    let result = unpickle(&w.bytes()).unwrap();
    match result {
        Value::Set(s) => assert_eq!(s.borrow().len(), 2),
        _ => panic!("expected a set"),
    }
}
