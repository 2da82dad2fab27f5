use phf::phf_map;

/// COCO 80 类标签
static COCO_LABELS: phf::Map<u32, &'static str> = phf_map! {
    0u32 => "Person",
    1u32 => "Bicycle",
    2u32 => "Car",
    3u32 => "Motorcycle",
    4u32 => "Airplane",
    5u32 => "Bus",
    6u32 => "Train",
    7u32 => "Truck",
    8u32 => "Boat",
    9u32 => "Traffic light",
    10u32 => "Fire hydrant",
    11u32 => "Stop sign",
    12u32 => "Parking meter",
    13u32 => "Bench",
    14u32 => "Bird",
    15u32 => "Cat",
    16u32 => "Dog",
    17u32 => "Horse",
    18u32 => "Sheep",
    19u32 => "Cow",
    20u32 => "Elephant",
    21u32 => "Bear",
    22u32 => "Zebra",
    23u32 => "Giraffe",
    24u32 => "Backpack",
    25u32 => "Umbrella",
    26u32 => "Handbag",
    27u32 => "Tie",
    28u32 => "Suitcase",
    29u32 => "Frisbee",
    30u32 => "Skis",
    31u32 => "Snowboard",
    32u32 => "Sports ball",
    33u32 => "Kite",
    34u32 => "Baseball bat",
    35u32 => "Baseball glove",
    36u32 => "Skateboard",
    37u32 => "Surfboard",
    38u32 => "Tennis racket",
    39u32 => "Bottle",
    40u32 => "Wine glass",
    41u32 => "Cup",
    42u32 => "Fork",
    43u32 => "Knife",
    44u32 => "Spoon",
    45u32 => "Bowl",
    46u32 => "Banana",
    47u32 => "Apple",
    48u32 => "Sandwich",
    49u32 => "Orange",
    50u32 => "Broccoli",
    51u32 => "Carrot",
    52u32 => "Hot dog",
    53u32 => "Pizza",
    54u32 => "Donut",
    55u32 => "Cake",
    56u32 => "Chair",
    57u32 => "Couch",
    58u32 => "Potted plant",
    59u32 => "Bed",
    60u32 => "Dining table",
    61u32 => "Toilet",
    62u32 => "TV",
    63u32 => "Laptop",
    64u32 => "Mouse",
    65u32 => "Remote",
    66u32 => "Keyboard",
    67u32 => "Cell phone",
    68u32 => "Microwave",
    69u32 => "Oven",
    70u32 => "Toaster",
    71u32 => "Sink",
    72u32 => "Refrigerator",
    73u32 => "Book",
    74u32 => "Clock",
    75u32 => "Vase",
    76u32 => "Scissors",
    77u32 => "Teddy bear",
    78u32 => "Hair drier",
    79u32 => "Toothbrush",
};

pub const NUM_COCO_CLASSES: usize = 80;

/// 类别ID → 可读标签, 未知ID渲染为 "Unknown (<id>)"
pub fn label_text(class_id: u32) -> String {
    match COCO_LABELS.get(&class_id) {
        Some(name) => (*name).to_string(),
        None => format!("Unknown ({})", class_id),
    }
}
